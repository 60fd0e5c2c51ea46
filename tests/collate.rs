use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use tempfile::TempDir;

use hapflow::config::defs::OUTPUT_CATEGORIES;
use hapflow::utils::collate::{collate, collate_categories};
use hapflow::utils::file::StorageLayout;

fn write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

#[test]
fn test_missing_outputs_give_empty_categories() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = StorageLayout::new(dir.path().join("uploads"), dir.path().join("never_created"));
    let result = collate(&storage);

    assert_eq!(result.categories.len(), OUTPUT_CATEGORIES.len());
    assert!(result.is_empty());
    for category in OUTPUT_CATEGORIES {
        let summary = result.category(category).ok_or_else(|| anyhow!("{} missing", category))?;
        assert!(!summary.exists);
        assert_eq!(summary.file_count, 0);
        assert!(summary.groups.is_empty());
    }
    Ok(())
}

#[test]
fn test_trim_files_pair_forward_and_reverse() -> Result<()> {
    let dir = TempDir::new()?;
    let trim = dir.path().join("trim");
    write(&trim.join("ZpDL.f.fq"), "ACGT\n")?;
    write(&trim.join("ZpDL.r.fq"), "TGCAAA\n")?;
    write(&trim.join("CypDL.f.fq"), "A\n")?;
    write(&trim.join("notes.txt"), "unpaired\n")?;

    let result = collate_categories(dir.path(), &["trim"]);
    let summary = result.category("trim").ok_or_else(|| anyhow!("no trim"))?;
    assert!(summary.exists);
    assert_eq!(summary.file_count, 4);
    assert_eq!(summary.total_bytes, 5 + 7 + 2 + 9);

    let zp = &summary.groups["ZpDL"];
    assert_eq!(zp.forward.as_ref().map(|f| f.size), Some(5));
    assert_eq!(zp.reverse.as_ref().map(|f| f.size), Some(7));
    let cyp = &summary.groups["CypDL"];
    assert!(cyp.forward.is_some());
    assert!(cyp.reverse.is_none());
    assert!(!summary.groups.contains_key("notes"));
    Ok(())
}

#[test]
fn test_nested_categories_group_by_subdirectory() -> Result<()> {
    let dir = TempDir::new()?;
    let separated = dir.path().join("separated");
    write(&separated.join("Zp").join("Zp.hap1.fasta"), ">h1\nACGT\n")?;
    write(&separated.join("Zp").join("deep").join("Zp.dup.list"), "1\n")?;
    write(&separated.join("Cyp").join("Cyp.hap1.fasta"), ">h1\n")?;
    write(&separated.join("README"), "top\n")?;

    let result = collate_categories(dir.path(), &["separated", "table"]);
    let summary = result.category("separated").ok_or_else(|| anyhow!("no separated"))?;
    assert_eq!(summary.groups.len(), 2);
    let zp_names: Vec<&str> = summary.groups["Zp"].files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(zp_names, vec!["Zp.hap1.fasta", "deep/Zp.dup.list"]);

    let all: Vec<&str> = summary.files.iter().map(|f| f.name.as_str()).collect();
    assert!(all.contains(&"README"));
    assert!(all.contains(&"Zp/deep/Zp.dup.list"));
    assert_eq!(summary.file_count, 4);

    let table = result.category("table").ok_or_else(|| anyhow!("no table"))?;
    assert!(!table.exists);
    assert_eq!(result.total_files, 4);
    Ok(())
}

#[test]
fn test_other_categories_group_by_leading_token() -> Result<()> {
    let dir = TempDir::new()?;
    write(&dir.path().join("filter").join("Zp.assembled.len.fasta"), ">a\n")?;
    write(&dir.path().join("filter").join("Zp.discarded.fasta"), ">b\n")?;
    write(&dir.path().join("filter").join("Cyp.assembled.len.fasta"), ">c\n")?;

    let result = collate_categories(dir.path(), &["filter"]);
    let summary = result.category("filter").ok_or_else(|| anyhow!("no filter"))?;
    assert_eq!(summary.groups["Zp"].files.len(), 2);
    assert_eq!(summary.groups["Cyp"].files.len(), 1);
    let names: Vec<&str> = summary.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["Cyp.assembled.len.fasta", "Zp.assembled.len.fasta", "Zp.discarded.fasta"]);
    Ok(())
}

#[test]
fn test_result_serialises_with_camel_case_keys() -> Result<()> {
    let dir = TempDir::new()?;
    write(&dir.path().join("blast").join("Zp.blast.txt"), "hit\n")?;
    let result = collate_categories(dir.path(), &["blast"]);
    let json = serde_json::to_value(&result)?;
    assert_eq!(json["totalFiles"], 1);
    assert_eq!(json["categories"]["blast"]["fileCount"], 1);
    assert_eq!(json["categories"]["blast"]["totalBytes"], 4);
    Ok(())
}
