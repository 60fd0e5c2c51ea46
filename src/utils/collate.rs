// src/utils/collate.rs: summarising the outputs tree after a successful run

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, warn};
use serde::Serialize;

use crate::config::defs::{NESTED_CATEGORIES, OUTPUT_CATEGORIES, PAIRED_CATEGORIES};
use crate::utils::file::{paired_file_parts, sample_prefix, ReadDirection, StorageLayout};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

/// Files that share a sample/species identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SampleGroup {
    pub files: Vec<FileEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward: Option<FileEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse: Option<FileEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    pub exists: bool,
    pub file_count: usize,
    pub total_bytes: u64,
    pub files: Vec<FileEntry>,
    pub groups: BTreeMap<String, SampleGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollatedResult {
    pub categories: BTreeMap<String, CategorySummary>,
    pub total_files: usize,
}

impl CollatedResult {
    pub fn category(&self, name: &str) -> Option<&CategorySummary> {
        self.categories.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.total_files == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grouping {
    Paired,
    Nested,
    Prefix,
}

fn grouping_for(category: &str) -> Grouping {
    if PAIRED_CATEGORIES.contains(&category) {
        Grouping::Paired
    } else if NESTED_CATEGORIES.contains(&category) {
        Grouping::Nested
    } else {
        Grouping::Prefix
    }
}

/// Collates every known output category under the outputs root.
pub fn collate(storage: &StorageLayout) -> CollatedResult {
    collate_categories(&storage.outputs_root, OUTPUT_CATEGORIES)
}

/// Collates `categories` under `outputs_root`. Missing directories become empty categories.
///
/// # Arguments
///
/// * `outputs_root` - Root of the outputs tree.
/// * `categories` - Directory names to summarise.
///
/// # Returns
/// CollatedResult with one entry per category.
pub fn collate_categories(outputs_root: &Path, categories: &[&str]) -> CollatedResult {
    let mut result = CollatedResult::default();
    for category in categories {
        let summary = summarise_category(&outputs_root.join(category), grouping_for(category));
        result.total_files += summary.file_count;
        result.categories.insert(category.to_string(), summary);
    }
    debug!("Collated {} files across {} categories", result.total_files, categories.len());
    result
}

fn summarise_category(dir: &Path, grouping: Grouping) -> CategorySummary {
    let mut summary = CategorySummary::default();
    if !dir.is_dir() {
        return summary;
    }
    summary.exists = true;

    let (files, subdirs) = list_dir(dir);
    match grouping {
        Grouping::Nested => {
            for file in &files {
                summary.files.push(file.clone());
            }
            for sub in subdirs {
                let mut group = SampleGroup::default();
                collect_recursive(&dir.join(&sub), "", &mut group.files);
                for entry in &group.files {
                    summary.files.push(FileEntry {
                        name: format!("{}/{}", sub, entry.name),
                        size: entry.size,
                    });
                }
                summary.groups.insert(sub, group);
            }
        }
        Grouping::Paired => {
            for file in files {
                if let Some((sample, direction)) = paired_file_parts(&file.name) {
                    let group = summary.groups.entry(sample).or_default();
                    match direction {
                        ReadDirection::Forward => group.forward = Some(file.clone()),
                        ReadDirection::Reverse => group.reverse = Some(file.clone()),
                    }
                    group.files.push(file.clone());
                }
                summary.files.push(file);
            }
        }
        Grouping::Prefix => {
            for file in files {
                summary
                    .groups
                    .entry(sample_prefix(&file.name))
                    .or_default()
                    .files
                    .push(file.clone());
                summary.files.push(file);
            }
        }
    }

    summary.files.sort_by(|a, b| a.name.cmp(&b.name));
    summary.file_count = summary.files.len();
    summary.total_bytes = summary.files.iter().map(|f| f.size).sum();
    summary
}

/// Files and subdirectory names directly under `dir`, sorted by name.
fn list_dir(dir: &Path) -> (Vec<FileEntry>, Vec<String>) {
    let mut files = Vec::new();
    let mut subdirs = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read {}: {}", dir.display(), e);
            return (files, subdirs);
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        match entry.metadata() {
            Ok(meta) if meta.is_dir() => subdirs.push(name),
            Ok(meta) => files.push(FileEntry { name, size: meta.len() }),
            Err(e) => warn!("Cannot stat {}: {}", entry.path().display(), e),
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    subdirs.sort();
    (files, subdirs)
}

fn collect_recursive(dir: &Path, prefix: &str, out: &mut Vec<FileEntry>) {
    let (files, subdirs) = list_dir(dir);
    for file in files {
        let name = if prefix.is_empty() {
            file.name
        } else {
            format!("{}/{}", prefix, file.name)
        };
        out.push(FileEntry { name, size: file.size });
    }
    for sub in subdirs {
        let nested = if prefix.is_empty() {
            sub.clone()
        } else {
            format!("{}/{}", prefix, sub)
        };
        collect_recursive(&dir.join(&sub), &nested, out);
    }
}
