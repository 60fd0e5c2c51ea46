use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

/// Minimum columns in a barcode row: location, three metadata fields, then
/// forward barcode, forward primer, reverse barcode, reverse primer.
const BARCODE_MIN_FIELDS: usize = 7;

/// Species prefixes present in a barcode CSV.
///
/// # Arguments
///
/// * `barcode_csv` - Path to the barcode sheet; column 0 holds `<species>_<location>`.
///
/// # Returns
/// Sorted species prefixes.
pub fn detect_species(barcode_csv: &Path) -> Result<Vec<String>> {
    let file = File::open(barcode_csv)
        .with_context(|| format!("Barcode file not found: {}", barcode_csv.display()))?;
    let mut species = BTreeSet::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < BARCODE_MIN_FIELDS {
            continue;
        }
        let location = fields[0];
        let prefix = location.split('_').next().unwrap_or(location);
        species.insert(prefix.to_string());
    }
    Ok(species.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_species_skips_short_rows() {
        let dir = tempfile::TempDir::new().unwrap();
        let csv = dir.path().join("barcodes.csv");
        std::fs::write(
            &csv,
            "ZpDL_CHR,x,x,x,AAAA,CCCC,GGGG\nCypDL_KKK,x,x,x,AAAA,CCCC,GGGG,TTTT\nZpDL_SAN,x,x,x,A,C,G\nshort,row\n\n",
        )
        .unwrap();
        assert_eq!(detect_species(&csv).unwrap(), vec!["CypDL", "ZpDL"]);
    }

    #[test]
    fn test_detect_species_missing_file() {
        assert!(detect_species(Path::new("/nonexistent/barcodes.csv")).is_err());
    }
}
