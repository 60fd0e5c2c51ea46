use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;

lazy_static! {
    /// `<sample>.<f|r>.<ext>`, e.g. `ZpDL.f.fq`.
    static ref PAIRED_FILE_RE: Regex = Regex::new(r"^(?P<sample>[^.]+)\.(?P<dir>[fr])\.(?P<ext>.+)$")
        .expect("paired file pattern is valid");
}

/// Uploads and outputs roots shared with the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub uploads_root: PathBuf,
    pub outputs_root: PathBuf,
}

impl StorageLayout {
    pub fn new(uploads_root: impl Into<PathBuf>, outputs_root: impl Into<PathBuf>) -> Self {
        StorageLayout {
            uploads_root: uploads_root.into(),
            outputs_root: outputs_root.into(),
        }
    }

    pub fn input_path(&self, file_name: &str) -> PathBuf {
        self.uploads_root.join(file_name)
    }

    pub fn output_dir(&self, category: &str) -> PathBuf {
        self.outputs_root.join(category)
    }

    /// Directory stages run from: the parent of the outputs root. Stage scripts write
    /// to relative `outputs/<category>` paths, so the outputs root is expected to be
    /// named `outputs`.
    pub fn work_root(&self) -> PathBuf {
        match self.outputs_root.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Creates both roots if missing.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.uploads_root)?;
        fs::create_dir_all(&self.outputs_root)?;
        if self.outputs_root.file_name().map(|n| n != "outputs").unwrap_or(true) {
            warn!(
                "Outputs root {} is not named 'outputs'; stages writing relative outputs/ paths will miss it",
                self.outputs_root.display()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadDirection {
    Forward,
    Reverse,
}

/// Splits `<sample>.<f|r>.<ext>` into sample and direction.
pub fn paired_file_parts(file_name: &str) -> Option<(String, ReadDirection)> {
    let caps = PAIRED_FILE_RE.captures(file_name)?;
    let direction = match &caps["dir"] {
        "f" => ReadDirection::Forward,
        _ => ReadDirection::Reverse,
    };
    Some((caps["sample"].to_string(), direction))
}

/// Leading `.`-separated token of a file name: `Zp.assembled.len.fasta` -> `Zp`.
pub fn sample_prefix(file_name: &str) -> String {
    file_name.split('.').next().unwrap_or(file_name).to_string()
}

/// Rejects names that would escape the uploads root.
pub fn is_plain_file_name(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path.components().count() == 1
        && path.file_name().map(|f| f == path.as_os_str()).unwrap_or(false)
}
