// src/context.rs

//! Per-run migration context
//!
//! Constructed once per import run and passed by reference to the components
//! that need the workspace, the persisted records or the journal.

use crate::config::ConfigFile;
use crate::journal::Journal;
use crate::model::{WiItem, WiItemProvider};
use crate::Result;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Workspace, records and journal of one run
pub struct MigrationContext {
    app: String,
    workspace: PathBuf,
    attachments_dir: PathBuf,
    force_fresh: bool,
    pub journal: Journal,
    pub provider: WiItemProvider,
}

impl MigrationContext {
    /// Open the workspace described by `config`, creating folders as needed
    pub fn open(app: &str, config: &ConfigFile, force_fresh: bool) -> Result<Self> {
        Self::open_workspace(
            app,
            &config.workspace,
            config.attachments_dir(),
            config.sprints_dir(),
            force_fresh,
        )
    }

    pub fn open_workspace(
        app: &str,
        workspace: &Path,
        attachments_dir: PathBuf,
        sprints_dir: PathBuf,
        force_fresh: bool,
    ) -> Result<Self> {
        std::fs::create_dir_all(workspace)?;
        std::fs::create_dir_all(&attachments_dir)?;
        std::fs::create_dir_all(&sprints_dir)?;

        let journal = Journal::open(workspace, force_fresh)?;
        let provider = WiItemProvider::new(workspace, sprints_dir);
        debug!("Migration context opened for {} in {}", app, workspace.display());

        Ok(Self {
            app: app.to_string(),
            workspace: workspace.to_path_buf(),
            attachments_dir,
            force_fresh,
            journal,
            provider,
        })
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn attachments_dir(&self) -> &Path {
        &self.attachments_dir
    }

    pub fn force_fresh(&self) -> bool {
        self.force_fresh
    }

    /// Load an item and resolve its target id from the journal
    pub fn get_item(&self, origin_id: &str) -> Result<WiItem> {
        let mut item = self.provider.load(origin_id)?;
        item.wi_id = self.journal.get_migrated_id(origin_id);
        Ok(item)
    }

    /// Load every item in the workspace with target ids resolved
    pub fn enumerate_all_items(&self) -> Result<Vec<WiItem>> {
        let mut items = self.provider.enumerate_all_items()?;
        for item in &mut items {
            item.wi_id = self.journal.get_migrated_id(&item.origin_id);
        }
        Ok(items)
    }
}
