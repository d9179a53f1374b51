// src/model/item.rs

//! Target-agnostic work items and their mapped revisions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use super::field::WiField;

/// Whether a link or attachment appears or disappears in a revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceChangeType {
    Added,
    Removed,
}

impl fmt::Display for ReferenceChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "Added"),
            Self::Removed => write!(f, "Removed"),
        }
    }
}

/// A link action between two items, expressed in origin ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiLink {
    pub change: ReferenceChangeType,
    pub source_origin_id: String,
    pub target_origin_id: String,
    /// Target relation type (e.g. `System.LinkTypes.Hierarchy-Reverse`)
    pub wi_type: String,
}

impl fmt::Display for WiLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] [{}] {}->{}",
            self.change, self.wi_type, self.source_origin_id, self.target_origin_id
        )
    }
}

/// An attachment action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiAttachment {
    pub change: ReferenceChangeType,
    /// Stable id of the attachment in the source system
    pub att_origin_id: String,
    /// Local path of the downloaded content
    pub file_path: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl WiAttachment {
    /// File name used to locate references in rich text
    ///
    /// Falls back to the last component of `file_path`, accepting both `/` and
    /// `\` separators since workspaces move between platforms.
    pub fn reference_name(&self) -> &str {
        if !self.file_name.is_empty() {
            return &self.file_name;
        }
        self.file_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.file_path)
    }

    /// True if the content is present on disk
    pub fn content_exists(&self) -> bool {
        Path::new(&self.file_path).is_file()
    }
}

impl fmt::Display for WiAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}/{}", self.change, self.att_origin_id, self.reference_name())
    }
}

/// One mapped revision, ready to be replayed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WiRevision {
    /// Origin id of the owning item; populated when the item is loaded
    #[serde(skip)]
    pub parent_origin_id: String,
    pub index: usize,
    pub time: DateTime<Utc>,
    pub author: String,
    #[serde(default)]
    pub fields: Vec<WiField>,
    #[serde(default)]
    pub links: Vec<WiLink>,
    #[serde(default)]
    pub attachments: Vec<WiAttachment>,
    /// Rich-text fields of this revision mention attachment file names
    #[serde(default)]
    pub attachment_references: bool,
}

impl WiRevision {
    pub fn new(index: usize, time: DateTime<Utc>, author: impl Into<String>) -> Self {
        Self {
            parent_origin_id: String::new(),
            index,
            time,
            author: author.into(),
            fields: Vec::new(),
            links: Vec::new(),
            attachments: Vec::new(),
            attachment_references: false,
        }
    }

    /// True if the revision carries no change at all
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.links.is_empty() && self.attachments.is_empty()
    }

    pub fn has_added_attachments(&self) -> bool {
        self.attachments
            .iter()
            .any(|a| a.change == ReferenceChangeType::Added)
    }
}

impl fmt::Display for WiRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}', rev {}", self.parent_origin_id, self.index)
    }
}

/// A work item and its ordered revisions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WiItem {
    pub origin_id: String,
    #[serde(rename = "type")]
    pub wi_type: String,
    /// Target id resolved from the journal at load time
    #[serde(skip)]
    pub wi_id: Option<i64>,
    pub revisions: Vec<WiRevision>,
}

impl WiItem {
    pub fn new(origin_id: impl Into<String>, wi_type: impl Into<String>) -> Self {
        Self {
            origin_id: origin_id.into(),
            wi_type: wi_type.into(),
            wi_id: None,
            revisions: Vec::new(),
        }
    }

    /// Set the parent back-reference on every revision
    pub fn link_revisions(&mut self) {
        for rev in &mut self.revisions {
            rev.parent_origin_id = self.origin_id.clone();
        }
    }

    /// Added attachments from every revision up to and including `index`
    pub fn attachments_through(&self, index: usize) -> impl Iterator<Item = &WiAttachment> {
        self.revisions
            .iter()
            .filter(move |r| r.index <= index)
            .flat_map(|r| r.attachments.iter())
            .filter(|a| a.change == ReferenceChangeType::Added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_display() {
        let mut rev = WiRevision::new(1, Utc::now(), "someone");
        rev.parent_origin_id = "parentOriginId".to_string();
        assert_eq!(rev.to_string(), "'parentOriginId', rev 1");
    }

    #[test]
    fn test_attachment_reference_name_from_windows_path() {
        let att = WiAttachment {
            change: ReferenceChangeType::Added,
            att_origin_id: "10001".into(),
            file_path: "C:\\Temp\\MyFiles\\my_image.png".into(),
            file_name: String::new(),
            comment: None,
        };
        assert_eq!(att.reference_name(), "my_image.png");
    }

    #[test]
    fn test_link_revisions_sets_parent() {
        let mut item = WiItem::new("PRJ-1", "Task");
        item.revisions.push(WiRevision::new(0, Utc::now(), "a"));
        item.revisions.push(WiRevision::new(1, Utc::now(), "a"));
        item.link_revisions();
        assert!(item.revisions.iter().all(|r| r.parent_origin_id == "PRJ-1"));
    }
}
