// src/model/provider.rs

//! Workspace persistence for item and iteration records
//!
//! Each item is stored as `<items_dir>/<origin_id>.json` and each iteration as
//! `<sprints_dir>/<name>.json`, pretty-printed so operators can inspect and
//! hand-fix exports between the export and import phases.

use crate::{Error, Result};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::warn;

use super::item::WiItem;
use super::iteration::WiIteration;

/// Escaped code points left behind by a known exporter defect
static ESCAPED_UNICODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\u[0-9A-Fa-f]{4}").expect("static pattern"));

/// Loads and stores persisted revision records
#[derive(Debug, Clone)]
pub struct WiItemProvider {
    items_dir: PathBuf,
    sprints_dir: PathBuf,
}

impl WiItemProvider {
    pub fn new(items_dir: impl Into<PathBuf>, sprints_dir: impl Into<PathBuf>) -> Self {
        Self {
            items_dir: items_dir.into(),
            sprints_dir: sprints_dir.into(),
        }
    }

    pub fn items_dir(&self) -> &Path {
        &self.items_dir
    }

    /// Load one item by origin id, populating each revision's parent id
    pub fn load(&self, origin_id: &str) -> Result<WiItem> {
        let path = self.items_dir.join(record_file_name(origin_id));
        load_item_file(&path)
    }

    /// Load one iteration by name
    pub fn load_iteration(&self, name: &str) -> Result<WiIteration> {
        let path = self.sprints_dir.join(record_file_name(name));
        load_file(&path)
    }

    pub fn save(&self, item: &WiItem) -> Result<()> {
        fs::create_dir_all(&self.items_dir)?;
        save_file(item, &self.items_dir.join(record_file_name(&item.origin_id)))
    }

    pub fn save_iteration(&self, iteration: &WiIteration) -> Result<()> {
        fs::create_dir_all(&self.sprints_dir)?;
        save_file(iteration, &self.sprints_dir.join(record_file_name(&iteration.name)))
    }

    /// Load every item record in the workspace
    ///
    /// Files that fail to parse are skipped with a warning; the workspace also
    /// holds configuration and other JSON files.
    pub fn enumerate_all_items(&self) -> Result<Vec<WiItem>> {
        let mut items = Vec::new();
        for path in json_files(&self.items_dir)? {
            match load_item_file(&path) {
                Ok(item) => items.push(item),
                Err(e) => warn!(
                    "Failed to load '{}' (perhaps not a migration file?): {}",
                    path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
                    e
                ),
            }
        }
        Ok(items)
    }

    /// Origin ids with an item file already present
    pub fn exported_keys(&self) -> Result<HashSet<String>> {
        stems(&self.items_dir)
    }

    /// Iteration names with a record already present
    pub fn exported_iterations(&self) -> Result<HashSet<String>> {
        stems(&self.sprints_dir)
    }
}

/// File name for a record key; path separators are not allowed in names
fn record_file_name(key: &str) -> String {
    let safe: String = key
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    format!("{safe}.json")
}

fn load_item_file(path: &Path) -> Result<WiItem> {
    let mut item: WiItem = load_file(path)?;
    if item.origin_id.is_empty() {
        return Err(Error::ParseError(format!(
            "{} has no origin id",
            path.display()
        )));
    }
    item.link_revisions();
    Ok(item)
}

fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let mut serialized = fs::read_to_string(path)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))?;

    if ESCAPED_UNICODE.is_match(&serialized) {
        warn!("Detected unicode characters in {}, removed.", path.display());
        serialized = ESCAPED_UNICODE.replace_all(&serialized, "").into_owned();
    }

    serde_json::from_str(&serialized)
        .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))
}

fn save_file<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let serialized = serde_json::to_string_pretty(value)?;
    // Write-then-rename so an interrupted export never leaves a truncated record
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serialized)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn stems(dir: &Path) -> Result<HashSet<String>> {
    Ok(json_files(dir)?
        .iter()
        .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldValue, WiField, WiRevision};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn sample_item() -> WiItem {
        let mut item = WiItem::new("PRJ-7", "Bug");
        let mut rev = WiRevision::new(0, Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap(), "ann");
        rev.fields.push(WiField::new("System.Title", "Broken"));
        rev.fields.push(WiField {
            reference_name: "Microsoft.VSTS.Common.Priority".into(),
            value: FieldValue::Number(2.0),
        });
        item.revisions.push(rev);
        item
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let provider = WiItemProvider::new(temp.path(), temp.path().join("sprints"));

        let item = sample_item();
        provider.save(&item).unwrap();

        let loaded = provider.load("PRJ-7").unwrap();
        assert_eq!(loaded.origin_id, item.origin_id);
        assert_eq!(loaded.revisions.len(), 1);
        assert_eq!(loaded.revisions[0].parent_origin_id, "PRJ-7");
        assert_eq!(loaded.revisions[0].fields, item.revisions[0].fields);
    }

    #[test]
    fn test_escaped_unicode_is_stripped() {
        let temp = TempDir::new().unwrap();
        let provider = WiItemProvider::new(temp.path(), temp.path().join("sprints"));
        let raw = r#"{"origin_id":"PRJ-1","type":"Task","revisions":[{"index":0,"time":"2023-01-01T00:00:00Z","author":"a\u00e9","fields":[]}]}"#;
        fs::write(temp.path().join("PRJ-1.json"), raw).unwrap();

        let item = provider.load("PRJ-1").unwrap();
        assert_eq!(item.revisions[0].author, "a");
    }

    #[test]
    fn test_enumerate_skips_foreign_json() {
        let temp = TempDir::new().unwrap();
        let provider = WiItemProvider::new(temp.path(), temp.path().join("sprints"));
        provider.save(&sample_item()).unwrap();
        fs::write(temp.path().join("config.json"), r#"{"workspace":"x"}"#).unwrap();

        let items = provider.enumerate_all_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(provider.exported_keys().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_item_is_not_found() {
        let temp = TempDir::new().unwrap();
        let provider = WiItemProvider::new(temp.path(), temp.path().join("sprints"));
        let err = provider.load("NOPE-1").unwrap_err();
        assert!(err.is_file_not_found());
    }

    #[test]
    fn test_iteration_roundtrip() {
        let temp = TempDir::new().unwrap();
        let provider = WiItemProvider::new(temp.path(), temp.path().join("sprints"));
        let mut iteration = WiIteration::new("Sprint 1");
        iteration.start_date = Some(Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).unwrap());
        provider.save_iteration(&iteration).unwrap();

        assert_eq!(provider.load_iteration("Sprint 1").unwrap(), iteration);
        assert!(provider.exported_iterations().unwrap().contains("Sprint 1"));
    }
}
