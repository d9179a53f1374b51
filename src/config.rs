// src/config.rs

//! Migration configuration file
//!
//! One file drives both phases of a migration. It is JSON by default; a file with
//! a `.toml` extension is read as TOML with the same keys.
//!
//! ```json
//! {
//!   "source-project": "PRJ",
//!   "target-project": "Migrated",
//!   "query": "project = PRJ ORDER BY key",
//!   "workspace": "/var/migrations/prj",
//!   "type-map": { "type": [{ "source": "Story", "target": "User Story" }] },
//!   "link-map": { "link": [{ "source": "Epic", "target": "System.LinkTypes.Hierarchy-Reverse" }] },
//!   "field-map": { "field": [{ "source": "summary", "target": "System.Title" }] }
//! }
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Bit flags selecting related items to pull into an export
pub mod download_options {
    pub const INCLUDE_PARENT_EPICS: u32 = 1;
    pub const INCLUDE_EPIC_CHILDREN: u32 = 2;
    pub const INCLUDE_PARENTS: u32 = 4;
    pub const INCLUDE_SUB_ITEMS: u32 = 8;
    pub const INCLUDE_LINKED_ITEMS: u32 = 16;
}

/// Value conversion applied by a field rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MapperKind {
    /// Copy the value as text
    #[default]
    #[serde(rename = "")]
    Identity,
    MapValue,
    MapUser,
    MapTags,
    MapArray,
    MapSprint,
    MapRendered,
    MapNumber,
    MapDate,
}

/// A source-to-target value pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuePair {
    pub source: String,
    pub target: String,
}

/// Value translations used by `MapValue`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueMapping {
    #[serde(default)]
    pub values: Vec<ValuePair>,
}

/// How a rule's source key is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// `source` is the field id
    #[default]
    Id,
    /// `source` is a display name resolved to the field id at startup
    Name,
}

/// One field mapping rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FieldRule {
    pub source: String,
    #[serde(default)]
    pub source_type: SourceType,
    pub target: String,
    /// Comma separated target types, or `All` / `Common`
    #[serde(default = "default_for")]
    pub r#for: String,
    #[serde(default)]
    pub not_for: Option<String>,
    #[serde(default)]
    pub mapper: MapperKind,
    #[serde(default)]
    pub mapping: Option<ValueMapping>,
}

impl FieldRule {
    /// True if the rule belongs to the shared base rule set
    pub fn is_base(&self) -> bool {
        self.r#for
            .split(',')
            .map(str::trim)
            .any(|t| t.eq_ignore_ascii_case("All") || t.eq_ignore_ascii_case("Common"))
    }

    /// True if the rule lists `wi_type` explicitly
    pub fn is_for(&self, wi_type: &str) -> bool {
        self.r#for.split(',').map(str::trim).any(|t| t == wi_type)
    }

    /// True if the rule excludes `wi_type`
    pub fn is_excluded(&self, wi_type: &str) -> bool {
        self.not_for
            .as_deref()
            .is_some_and(|n| n.split(',').map(str::trim).any(|t| t == wi_type))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMap {
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeMap {
    #[serde(default, rename = "type")]
    pub types: Vec<ValuePair>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkMap {
    #[serde(default, rename = "link")]
    pub links: Vec<ValuePair>,
}

/// Parsed migration configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    pub source_project: String,
    #[serde(default)]
    pub target_project: String,
    #[serde(default)]
    pub query: Option<String>,
    pub workspace: PathBuf,
    #[serde(default = "default_epic_link_field")]
    pub epic_link_field: String,
    #[serde(default = "default_sprint_field")]
    pub sprint_field: String,
    #[serde(default)]
    pub download_options: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_attachment_folder")]
    pub attachment_folder: String,
    #[serde(default = "default_sprints_folder")]
    pub sprints_folder: String,
    #[serde(default)]
    pub user_mapping_file: Option<String>,
    #[serde(default)]
    pub base_area_path: String,
    #[serde(default)]
    pub base_iteration_path: String,
    #[serde(default)]
    pub ignore_failed_links: bool,
    #[serde(default = "default_process_template")]
    pub process_template: String,
    #[serde(default = "default_true")]
    pub using_jira_cloud: bool,
    #[serde(default)]
    pub source_board_id: Option<String>,
    #[serde(default)]
    pub link_map: LinkMap,
    #[serde(default)]
    pub type_map: TypeMap,
    #[serde(default)]
    pub field_map: FieldMap,
}

fn default_for() -> String {
    "All".to_string()
}

fn default_epic_link_field() -> String {
    "Epic Link".to_string()
}

fn default_sprint_field() -> String {
    "Sprint".to_string()
}

fn default_batch_size() -> usize {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_attachment_folder() -> String {
    "Attachments".to_string()
}

fn default_sprints_folder() -> String {
    "Sprints".to_string()
}

fn default_process_template() -> String {
    "Scrum".to_string()
}

fn default_true() -> bool {
    true
}

impl ConfigFile {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;

        let config: Self = if path.extension().is_some_and(|e| e == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::ConfigError(format!("{}: {}", path.display(), e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::ConfigError(format!("{}: {}", path.display(), e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.workspace.as_os_str().is_empty() {
            return Err(Error::ConfigError("workspace must be set".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::ConfigError("batch-size must be positive".to_string()));
        }
        for (key, path) in [
            ("base-area-path", &self.base_area_path),
            ("base-iteration-path", &self.base_iteration_path),
        ] {
            if path.starts_with(['\\', '/']) || path.ends_with(['\\', '/']) {
                return Err(Error::ConfigError(format!(
                    "{key} must not start or end with a path separator: '{path}'"
                )));
            }
        }
        Ok(())
    }

    pub fn includes(&self, option: u32) -> bool {
        self.download_options & option != 0
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.workspace.join(&self.attachment_folder)
    }

    pub fn sprints_dir(&self) -> PathBuf {
        self.workspace.join(&self.sprints_folder)
    }

    /// User mapping file, resolved against the workspace
    pub fn user_mapping_path(&self) -> Option<PathBuf> {
        self.user_mapping_file
            .as_deref()
            .filter(|f| !f.is_empty())
            .map(|f| self.workspace.join(f))
    }

    /// JQL used to select exported issues
    pub fn effective_query(&self) -> String {
        self.query
            .clone()
            .filter(|q| !q.trim().is_empty())
            .unwrap_or_else(|| format!("project = {} ORDER BY key ASC", self.source_project))
    }

    /// Target type for a source issue type; unmapped types keep their name
    pub fn map_type(&self, source_type: &str) -> String {
        self.type_map
            .types
            .iter()
            .find(|t| t.source == source_type)
            .map(|t| t.target.clone())
            .unwrap_or_else(|| source_type.to_string())
    }
}
