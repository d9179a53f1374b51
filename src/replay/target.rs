// src/replay/target.rs

//! Target system abstraction
//!
//! The agent talks to the work-tracking target only through
//! [`TargetConnector`]. A revision's changes are collected in a
//! [`WorkItemPatch`] and submitted in one update request.

use crate::model::FieldValue;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Relation type of file attachments
pub const ATTACHED_FILE_REL: &str = "AttachedFile";

/// Relation attribute holding the attachment comment and origin id
pub const COMMENT_ATTRIBUTE: &str = "comment";

/// Relation attribute holding the attachment file name
pub const NAME_ATTRIBUTE: &str = "name";

/// A relation from a work item to another item or an attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub rel: String,
    pub url: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Relation {
    pub fn new(rel: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            rel: rel.into(),
            url: url.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_attachment(&self) -> bool {
        self.rel == ATTACHED_FILE_REL
    }

    /// Same relation type and same target
    pub fn same_target(&self, other: &Relation) -> bool {
        self.rel == other.rel && self.url.eq_ignore_ascii_case(&other.url)
    }
}

/// Remote state of a work item
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkItem {
    /// Absent until the target assigned an id
    pub id: Option<i64>,
    pub url: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub relations: Vec<Relation>,
}

impl WorkItem {
    pub fn field(&self, reference_name: &str) -> Option<&FieldValue> {
        self.fields.get(reference_name)
    }

    /// Text of a field, empty when absent
    pub fn field_text(&self, reference_name: &str) -> &str {
        self.field(reference_name)
            .and_then(FieldValue::as_str)
            .unwrap_or("")
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "work item {id}"),
            None => write!(f, "work item (n/a) at {}", self.url),
        }
    }
}

/// Pending changes of one save
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkItemPatch {
    /// Field values to set; [`FieldValue::Empty`] clears a field
    pub fields: BTreeMap<String, FieldValue>,
    /// Relations to append
    pub added_relations: Vec<Relation>,
    /// Indexes into the remote relation list to remove
    pub removed_relations: Vec<usize>,
}

impl WorkItemPatch {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.added_relations.is_empty() && self.removed_relations.is_empty()
    }

    pub fn set_field(&mut self, reference_name: &str, value: FieldValue) {
        self.fields.insert(reference_name.to_string(), value);
    }

    pub fn remove_field(&mut self, reference_name: &str) -> Option<FieldValue> {
        self.fields.remove(reference_name)
    }

    /// Pending value of a field, else the remote value
    pub fn effective_field<'a>(&'a self, wi: &'a WorkItem, reference_name: &str) -> Option<&'a FieldValue> {
        self.fields.get(reference_name).or_else(|| wi.field(reference_name))
    }

    /// Remote relations that survive this patch, followed by the added ones
    pub fn effective_relations<'a>(&'a self, wi: &'a WorkItem) -> impl Iterator<Item = &'a Relation> {
        wi.relations
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.removed_relations.contains(i))
            .map(|(_, r)| r)
            .chain(self.added_relations.iter())
    }

    /// Queue removal of the remote relation at `index`
    pub fn remove_relation(&mut self, index: usize) {
        if !self.removed_relations.contains(&index) {
            self.removed_relations.push(index);
        }
    }

    /// Removal indexes, highest first, so earlier removals do not shift later ones
    pub fn removal_order(&self) -> Vec<usize> {
        let mut order = self.removed_relations.clone();
        order.sort_unstable_by(|a, b| b.cmp(a));
        order
    }
}

/// Area or iteration tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClassificationKind {
    Area,
    Iteration,
}

impl ClassificationKind {
    /// Path segment used by the classification REST resources
    pub fn structure_group(&self) -> &'static str {
        match self {
            Self::Area => "areas",
            Self::Iteration => "iterations",
        }
    }
}

impl fmt::Display for ClassificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Area => write!(f, "area"),
            Self::Iteration => write!(f, "iteration"),
        }
    }
}

/// A node of a classification tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationNode {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub children: Vec<ClassificationNode>,
}

/// Request to create a classification node
#[derive(Debug, Clone, PartialEq)]
pub struct NewClassificationNode {
    pub name: String,
    pub start_date: Option<DateTime<Utc>>,
    pub finish_date: Option<DateTime<Utc>>,
}

/// Target project summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetProject {
    pub id: String,
    pub name: String,
}

/// State of an asynchronous target operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    InProgress,
    Succeeded,
    Failed,
}

/// Blocking client of the target work-tracking system
pub trait TargetConnector {
    /// Fetch an item; `None` if the target returned no object
    fn get_work_item(&self, id: i64) -> Result<Option<WorkItem>>;

    /// Create a blank item of `wi_type`; `None` if the target returned no object
    fn create_work_item(&self, wi_type: &str) -> Result<Option<WorkItem>>;

    /// Apply `patch` in one request, bypassing workflow rules
    fn update_work_item(&self, id: i64, patch: &WorkItemPatch) -> Result<WorkItem>;

    /// Root of the area or iteration tree
    fn get_classification_tree(&self, kind: ClassificationKind) -> Result<ClassificationNode>;

    /// Create a node below `parent_path` (`/`-separated, empty for the root)
    fn create_classification_node(
        &self,
        kind: ClassificationKind,
        node: &NewClassificationNode,
        parent_path: &str,
    ) -> Result<ClassificationNode>;

    /// Upload file content and return its attachment URL
    fn upload_attachment(&self, path: &Path) -> Result<String>;

    fn get_project(&self, name: &str) -> Result<Option<TargetProject>>;

    /// Queue project creation and return the operation id
    fn queue_create_project(&self, name: &str, description: &str, process_template: &str) -> Result<String>;

    fn get_operation(&self, operation_id: &str) -> Result<OperationStatus>;

    /// Browser URL of a work item, used as the link relation target
    fn work_item_url(&self, id: i64) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_relations_skip_removed() {
        let wi = WorkItem {
            id: Some(1),
            relations: vec![Relation::new("a", "u1"), Relation::new("b", "u2")],
            ..Default::default()
        };
        let mut patch = WorkItemPatch::default();
        patch.remove_relation(0);
        patch.remove_relation(0);
        patch.added_relations.push(Relation::new("c", "u3"));

        let rels: Vec<&str> = patch.effective_relations(&wi).map(|r| r.rel.as_str()).collect();
        assert_eq!(rels, vec!["b", "c"]);
        assert_eq!(patch.removed_relations.len(), 1);
    }

    #[test]
    fn test_removal_order_is_descending() {
        let mut patch = WorkItemPatch::default();
        patch.remove_relation(1);
        patch.remove_relation(4);
        patch.remove_relation(2);
        assert_eq!(patch.removal_order(), vec![4, 2, 1]);
    }

    #[test]
    fn test_same_target_ignores_url_case() {
        let a = Relation::new("System.LinkTypes.Related", "https://x/WorkItems/5");
        let b = Relation::new("System.LinkTypes.Related", "https://x/workitems/5");
        assert!(a.same_target(&b));
        assert!(!a.same_target(&Relation::new("Other", "https://x/workitems/5")));
    }
}
