// src/replay/memory.rs

//! In-process target used for dry runs and tests
//!
//! Holds work items, classification trees and uploaded attachments in memory
//! and applies patches with the same semantics as the remote service: fields
//! set or cleared, relations removed by index (highest first) and then added
//! unless an identical relation already exists.

use super::target::{
    ClassificationKind, ClassificationNode, NewClassificationNode, OperationStatus, TargetConnector,
    TargetProject, WorkItem, WorkItemPatch,
};
use crate::model::{FieldValue, field_ref};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    items: BTreeMap<i64, WorkItem>,
    areas: Vec<ClassificationNode>,
    iterations: Vec<ClassificationNode>,
    next_node_id: i64,
    nodes_created: usize,
    uploads: Vec<String>,
    updates: usize,
    failing_creates: usize,
    lost_responses: usize,
    rejected_uploads: usize,
    projects: Vec<TargetProject>,
}

/// Target connector backed by process memory
#[derive(Debug)]
pub struct InMemoryTarget {
    project: String,
    state: Mutex<State>,
}

impl InMemoryTarget {
    pub fn new(project: impl Into<String>) -> Self {
        let project = project.into();
        let state = State {
            next_id: 1,
            next_node_id: 1000,
            projects: vec![TargetProject {
                id: "memory".to_string(),
                name: project.clone(),
            }],
            ..Default::default()
        };
        Self {
            project,
            state: Mutex::new(state),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Make the next `count` create requests return no object
    pub fn fail_next_creates(&self, count: usize) {
        self.state.lock().failing_creates = count;
    }

    /// Apply the next `count` updates but answer them with an error, as when
    /// the response is lost after the service committed the change
    pub fn lose_next_update_responses(&self, count: usize) {
        self.state.lock().lost_responses = count;
    }

    /// Answer the next `count` uploads as if the endpoint did not exist
    pub fn reject_next_uploads(&self, count: usize) {
        self.state.lock().rejected_uploads = count;
    }

    /// Snapshot of a stored item
    pub fn item(&self, id: i64) -> Option<WorkItem> {
        self.state.lock().items.get(&id).cloned()
    }

    pub fn item_count(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Number of update requests received
    pub fn update_count(&self) -> usize {
        self.state.lock().updates
    }

    /// Paths of uploaded files, in upload order
    pub fn uploads(&self) -> Vec<String> {
        self.state.lock().uploads.clone()
    }

    /// Number of classification nodes created through the connector
    pub fn nodes_created(&self) -> usize {
        self.state.lock().nodes_created
    }

    /// Add an existing node below `parent_path` without counting it as created
    pub fn seed_classification(&self, kind: ClassificationKind, parent_path: &str, name: &str) {
        let mut state = self.state.lock();
        let id = state.next_node_id;
        state.next_node_id += 1;
        let node = ClassificationNode {
            id,
            name: name.to_string(),
            children: Vec::new(),
        };
        let roots = match kind {
            ClassificationKind::Area => &mut state.areas,
            ClassificationKind::Iteration => &mut state.iterations,
        };
        if let Some(children) = children_at(roots, parent_path) {
            children.push(node);
        }
    }

    /// True if `path` exists in the tree
    pub fn has_classification(&self, kind: ClassificationKind, path: &str) -> bool {
        let state = self.state.lock();
        let mut nodes = match kind {
            ClassificationKind::Area => &state.areas,
            ClassificationKind::Iteration => &state.iterations,
        };
        for segment in path.split('/') {
            match nodes.iter().find(|n| n.name.eq_ignore_ascii_case(segment)) {
                Some(node) => nodes = &node.children,
                None => return false,
            }
        }
        true
    }

    fn url(&self, id: i64) -> String {
        format!("memory://{}/workitems/{}", self.project, id)
    }
}

/// Children list of the node at `path`, or the roots for an empty path
fn children_at<'a>(roots: &'a mut Vec<ClassificationNode>, path: &str) -> Option<&'a mut Vec<ClassificationNode>> {
    let mut nodes = roots;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        nodes = &mut nodes
            .iter_mut()
            .find(|n| n.name.eq_ignore_ascii_case(segment))?
            .children;
    }
    Some(nodes)
}

impl TargetConnector for InMemoryTarget {
    fn get_work_item(&self, id: i64) -> Result<Option<WorkItem>> {
        Ok(self.state.lock().items.get(&id).cloned())
    }

    fn create_work_item(&self, wi_type: &str) -> Result<Option<WorkItem>> {
        let mut state = self.state.lock();
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Ok(None);
        }
        let id = state.next_id;
        state.next_id += 1;

        let mut fields = BTreeMap::new();
        fields.insert(field_ref::WORK_ITEM_TYPE.to_string(), FieldValue::from(wi_type));
        let wi = WorkItem {
            id: Some(id),
            url: self.url(id),
            fields,
            relations: Vec::new(),
        };
        state.items.insert(id, wi.clone());
        debug!("Created {} '{}'", wi, wi_type);
        Ok(Some(wi))
    }

    fn update_work_item(&self, id: i64, patch: &WorkItemPatch) -> Result<WorkItem> {
        let mut state = self.state.lock();
        state.updates += 1;
        let wi = state
            .items
            .get_mut(&id)
            .ok_or_else(|| Error::NotFoundError(format!("work item {id}")))?;

        // The patch is rejected as a whole, before anything changes
        if let Some(index) = patch.removal_order().into_iter().find(|&i| i >= wi.relations.len()) {
            return Err(Error::invalid_argument(format!(
                "relation index {index} out of range for work item {id}"
            )));
        }

        for (name, value) in &patch.fields {
            wi.fields.insert(name.clone(), value.clone());
        }
        for index in patch.removal_order() {
            wi.relations.remove(index);
        }
        for relation in &patch.added_relations {
            if !wi.relations.iter().any(|r| r.same_target(relation)) {
                wi.relations.push(relation.clone());
            }
        }
        let updated = wi.clone();

        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            return Err(Error::DownloadError(format!("no response for update of work item {id}")));
        }
        Ok(updated)
    }

    fn get_classification_tree(&self, kind: ClassificationKind) -> Result<ClassificationNode> {
        let state = self.state.lock();
        let children = match kind {
            ClassificationKind::Area => state.areas.clone(),
            ClassificationKind::Iteration => state.iterations.clone(),
        };
        Ok(ClassificationNode {
            id: 0,
            name: self.project.clone(),
            children,
        })
    }

    fn create_classification_node(
        &self,
        kind: ClassificationKind,
        node: &NewClassificationNode,
        parent_path: &str,
    ) -> Result<ClassificationNode> {
        let mut state = self.state.lock();
        let id = state.next_node_id;
        state.next_node_id += 1;
        state.nodes_created += 1;

        let created = ClassificationNode {
            id,
            name: node.name.clone(),
            children: Vec::new(),
        };
        let roots = match kind {
            ClassificationKind::Area => &mut state.areas,
            ClassificationKind::Iteration => &mut state.iterations,
        };
        let siblings = children_at(roots, parent_path)
            .ok_or_else(|| Error::NotFoundError(format!("{kind} '{parent_path}'")))?;
        if let Some(existing) = siblings.iter().find(|n| n.name.eq_ignore_ascii_case(&node.name)) {
            return Ok(existing.clone());
        }
        siblings.push(created.clone());
        Ok(created)
    }

    fn upload_attachment(&self, path: &Path) -> Result<String> {
        std::fs::metadata(path)?;
        let mut state = self.state.lock();
        if state.rejected_uploads > 0 {
            state.rejected_uploads -= 1;
            return Err(Error::NotFoundError(format!("attachment endpoint for {}", path.display())));
        }
        state.uploads.push(path.display().to_string());
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!(
            "memory://{}/attachments/{}/{}",
            self.project,
            state.uploads.len(),
            file_name
        ))
    }

    fn get_project(&self, name: &str) -> Result<Option<TargetProject>> {
        Ok(self
            .state
            .lock()
            .projects
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    fn queue_create_project(&self, name: &str, _description: &str, _process_template: &str) -> Result<String> {
        let mut state = self.state.lock();
        let id = format!("op-{}", state.projects.len());
        state.projects.push(TargetProject {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    fn get_operation(&self, _operation_id: &str) -> Result<OperationStatus> {
        Ok(OperationStatus::Succeeded)
    }

    fn work_item_url(&self, id: i64) -> String {
        self.url(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::target::Relation;

    #[test]
    fn test_create_assigns_sequential_ids() {
        let target = InMemoryTarget::new("Proj");
        let a = target.create_work_item("Task").unwrap().unwrap();
        let b = target.create_work_item("Bug").unwrap().unwrap();
        assert_eq!(a.id, Some(1));
        assert_eq!(b.id, Some(2));
        assert_eq!(b.field_text(field_ref::WORK_ITEM_TYPE), "Bug");
    }

    #[test]
    fn test_failing_creates_return_none() {
        let target = InMemoryTarget::new("Proj");
        target.fail_next_creates(1);
        assert!(target.create_work_item("Task").unwrap().is_none());
        assert!(target.create_work_item("Task").unwrap().is_some());
    }

    #[test]
    fn test_update_applies_removals_before_adds_and_dedups() {
        let target = InMemoryTarget::new("Proj");
        let wi = target.create_work_item("Task").unwrap().unwrap();
        let id = wi.id.unwrap();

        let mut patch = WorkItemPatch::default();
        patch.set_field(field_ref::TITLE, "A".into());
        patch.added_relations.push(Relation::new("r", "u1"));
        patch.added_relations.push(Relation::new("r", "u2"));
        target.update_work_item(id, &patch).unwrap();

        let mut patch = WorkItemPatch::default();
        patch.remove_relation(0);
        patch.added_relations.push(Relation::new("r", "u2"));
        let updated = target.update_work_item(id, &patch).unwrap();

        assert_eq!(updated.field_text(field_ref::TITLE), "A");
        assert_eq!(updated.relations.len(), 1);
        assert_eq!(updated.relations[0].url, "u2");
        assert_eq!(target.update_count(), 2);
    }

    #[test]
    fn test_bad_relation_index_leaves_item_unchanged() {
        let target = InMemoryTarget::new("Proj");
        let id = target.create_work_item("Task").unwrap().unwrap().id.unwrap();

        let mut patch = WorkItemPatch::default();
        patch.set_field(field_ref::TITLE, "A".into());
        patch.remove_relation(3);
        assert!(target.update_work_item(id, &patch).is_err());

        let wi = target.item(id).unwrap();
        assert!(wi.field(field_ref::TITLE).is_none());
    }

    #[test]
    fn test_lost_response_still_applies_update() {
        let target = InMemoryTarget::new("Proj");
        let id = target.create_work_item("Task").unwrap().unwrap().id.unwrap();
        target.lose_next_update_responses(1);

        let mut patch = WorkItemPatch::default();
        patch.added_relations.push(Relation::new("r", "u1"));
        assert!(target.update_work_item(id, &patch).is_err());
        assert_eq!(target.item(id).unwrap().relations.len(), 1);
        assert!(target.update_work_item(id, &patch).is_ok());
        assert_eq!(target.item(id).unwrap().relations.len(), 1);
    }

    #[test]
    fn test_classification_nodes_nest() {
        let target = InMemoryTarget::new("Proj");
        let node = |name: &str| NewClassificationNode {
            name: name.into(),
            start_date: None,
            finish_date: None,
        };
        target
            .create_classification_node(ClassificationKind::Iteration, &node("R1"), "")
            .unwrap();
        target
            .create_classification_node(ClassificationKind::Iteration, &node("S1"), "R1")
            .unwrap();
        assert!(target.has_classification(ClassificationKind::Iteration, "R1/S1"));
        assert!(!target.has_classification(ClassificationKind::Area, "R1"));
        assert!(
            target
                .create_classification_node(ClassificationKind::Area, &node("X"), "Missing")
                .is_err()
        );
    }

    #[test]
    fn test_upload_requires_content() {
        let temp = tempfile::TempDir::new().unwrap();
        let target = InMemoryTarget::new("Proj");
        let err = target.upload_attachment(&temp.path().join("gone.png")).unwrap_err();
        assert!(err.is_file_not_found());

        let file = temp.path().join("a.png");
        std::fs::write(&file, b"png").unwrap();
        let url = target.upload_attachment(&file).unwrap();
        assert!(url.ends_with("/1/a.png"));
    }
}
