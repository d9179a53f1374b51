// src/replay/classification.rs

//! Area and iteration path materialization
//!
//! Paths are `/`-separated below the project root. Each kind of tree shares one
//! cache of known nodes keyed by `(kind, path)`, guarded by a single lock, so a
//! node is created at most once per run regardless of how many revisions name
//! it.

use super::target::{ClassificationKind, ClassificationNode, NewClassificationNode, TargetConnector};
use crate::model::WiItemProvider;
use crate::telemetry::Severity;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};

/// Known classification nodes of the target project
#[derive(Debug, Default)]
pub struct ClassificationCache {
    nodes: Mutex<HashMap<(ClassificationKind, String), i64>>,
}

impl ClassificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the existing tree of `kind`; returns the number of cached nodes
    pub fn warm_up(&self, target: &dyn TargetConnector, kind: ClassificationKind) -> Result<usize> {
        info!("Building {} cache...", kind);
        let root = target.get_classification_tree(kind)?;

        let mut nodes = self.nodes.lock();
        let mut added = 0;
        for child in &root.children {
            added += cache_subtree(&mut nodes, kind, child, "");
        }
        Ok(added)
    }

    pub fn get(&self, kind: ClassificationKind, path: &str) -> Option<i64> {
        self.nodes.lock().get(&(kind, path.to_string())).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Make sure `path` and all its ancestors exist in the target tree
    ///
    /// Parents are ensured first. Iteration nodes take their start and finish
    /// dates from the persisted iteration named after the leaf, when one exists.
    /// A failed creation is critical; with the run continuing it yields `None`.
    pub fn ensure(
        &self,
        target: &dyn TargetConnector,
        provider: &WiItemProvider,
        kind: ClassificationKind,
        path: &str,
    ) -> Result<Option<i64>> {
        if path.trim().is_empty() {
            return Err(Error::invalid_argument(format!("empty {kind} path")));
        }

        let (parent, name) = match path.rsplit_once('/') {
            Some((parent, name)) => (parent, name),
            None => ("", path),
        };
        if !parent.is_empty() {
            self.ensure(target, provider, kind, parent)?;
        }

        let mut nodes = self.nodes.lock();
        let key = (kind, path.to_string());
        if let Some(id) = nodes.get(&key) {
            return Ok(Some(*id));
        }

        let request = node_request(provider, kind, name);
        match target.create_classification_node(kind, &request, parent) {
            Ok(node) => {
                debug!("{} '{}' added to target", kind, path);
                nodes.insert(key, node.id);
                Ok(Some(node.id))
            }
            Err(e) if e.is_abort() => Err(e),
            Err(e) => {
                drop(nodes);
                Severity::Critical.report(&format!("Error while adding {kind} '{path}' to target: {e}"))?;
                Ok(None)
            }
        }
    }
}

fn cache_subtree(
    nodes: &mut HashMap<(ClassificationKind, String), i64>,
    kind: ClassificationKind,
    node: &ClassificationNode,
    parent_path: &str,
) -> usize {
    let path = if parent_path.is_empty() {
        node.name.clone()
    } else {
        format!("{}/{}", parent_path, node.name)
    };
    debug!("{} '{}' added to cache", kind, path);
    let mut added = 1;
    for child in &node.children {
        added += cache_subtree(nodes, kind, child, &path);
    }
    nodes.insert((kind, path), node.id);
    added
}

fn node_request(provider: &WiItemProvider, kind: ClassificationKind, name: &str) -> NewClassificationNode {
    let mut request = NewClassificationNode {
        name: name.to_string(),
        start_date: None,
        finish_date: None,
    };
    if kind == ClassificationKind::Iteration {
        match provider.load_iteration(name) {
            Ok(iteration) => {
                request.start_date = iteration.start_date;
                request.finish_date = iteration.end_date;
            }
            Err(e) => debug!("No exported iteration found for '{}': {}", name, e),
        }
    }
    request
}
