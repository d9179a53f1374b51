// src/source/mod.rs

//! Source issue tracker access and revision reconstruction
//!
//! The [`SourceConnector`] trait is the contract the export consumes; `jira`
//! implements it over the Jira REST API. The `revision` module rebuilds an
//! ordered, sparse revision history from an issue snapshot and its changelog.

mod jira;
mod revision;
mod utility;

pub use jira::{JiraClient, JiraSettings};
pub use revision::{
    BuildSettings, COMMENT_FIELD, EPIC_LINK_TYPE, PARENT_LINK_TYPE, RevisionAction,
    RevisionChangeType, SourceAttachment, SourceItem, SourceLink, SourceRevision,
    normalize_field_value,
};
pub use utility::{REVISION_SPACING, next_valid_delta_rev, replace_html_elements};

use crate::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::path::Path;

/// A user as returned in source payloads
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceUser {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl SourceUser {
    /// Stable identity used for user mapping
    pub fn identity(&self) -> Option<&str> {
        self.account_id
            .as_deref()
            .or(self.name.as_deref())
            .or(self.email_address.as_deref())
    }
}

/// One field change within a changelog entry
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangelogItem {
    pub field: String,
    #[serde(default)]
    pub field_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub from_string: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub to_string: Option<String>,
}

impl ChangelogItem {
    /// Key of the changed field: its id when the server reports one
    pub fn key(&self) -> &str {
        self.field_id.as_deref().unwrap_or(&self.field)
    }
}

/// One changelog entry (a set of field changes made at once)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangelogEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub author: Option<SourceUser>,
    #[serde(deserialize_with = "deserialize_source_date")]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub items: Vec<ChangelogItem>,
}

/// A board sprint
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSprint {
    pub origin_id: String,
    pub origin_board_id: Option<String>,
    pub name: String,
    pub state: Option<String>,
    pub goal: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub activated_date: Option<DateTime<Utc>>,
    pub completed_date: Option<DateTime<Utc>>,
}

/// Source server description for session banners
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub deployment_type: String,
}

/// Contract consumed by the export
pub trait SourceConnector {
    /// Issue snapshot with `fields` and `renderedFields`
    fn get_issue(&self, key: &str) -> Result<Value>;

    /// Every changelog entry of an issue, oldest first
    fn get_changelog(&self, key: &str) -> Result<Vec<ChangelogEntry>>;

    /// Field id for a field display name
    fn get_custom_id(&self, field_name: &str) -> Result<Option<String>>;

    /// All sprints of a board, paging until the last page
    fn get_sprints(&self, board_id: &str) -> Result<Vec<SourceSprint>>;

    /// One page of issue keys matching a query
    fn search_keys(&self, query: &str, start_at: usize, max_results: usize) -> Result<Vec<String>>;

    /// Total number of issues matching a query
    fn get_item_count(&self, query: &str) -> Result<usize>;

    /// Download attachment content to `dest`
    fn download_attachment(&self, url: &str, dest: &Path) -> Result<()>;

    fn server_info(&self) -> Result<ServerInfo>;
}

/// Parse a source timestamp (`2023-01-02T03:04:05.000+0000` or RFC 3339)
pub fn parse_source_date(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_time(chrono::NaiveTime::MIN).and_utc());
    }
    Err(Error::ParseError(format!("Unrecognized date '{s}'")))
}

fn deserialize_source_date<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_source_date(&s).map_err(serde::de::Error::custom)
}
