// src/commands/export.rs
//! Jira export command

use super::load_config;
use crate::cli::RunArgs;
use anyhow::{Context, Result};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use workitem_migrator::mapper::{FieldIds, Mapper, UserMapping, attachment_path};
use workitem_migrator::model::WiItemProvider;
use workitem_migrator::progress::{self, ProgressTracker};
use workitem_migrator::source::{
    BuildSettings, JiraClient, JiraSettings, RevisionChangeType, SourceConnector, SourceItem,
};
use workitem_migrator::config::download_options;
use workitem_migrator::{ConfigFile, telemetry};

const APP: &str = "jira-export";

/// Running totals of an export
#[derive(Debug, Default)]
struct ExportStats {
    exported: usize,
    skipped: usize,
    empty: usize,
    failed: usize,
    sprints: usize,
}

/// Everything needed to export one issue
struct Exporter<'a> {
    config: &'a ConfigFile,
    client: &'a dyn SourceConnector,
    mapper: Mapper,
    provider: WiItemProvider,
    build_settings: BuildSettings,
}

/// Export issues matching the configured query into the workspace
pub fn cmd_export(run: &RunArgs, url: &str, user: &str, password: &str) -> Result<()> {
    let config = load_config(&run.config)?;
    let log_path = telemetry::init(APP, &config.workspace, &config.log_level, run.continue_on_critical)
        .context("Failed to initialize logging")?;
    let started = Instant::now();

    telemetry::log_banner(
        "Export started",
        &[
            ("Tool version", env!("CARGO_PKG_VERSION").to_string()),
            ("Start time", chrono::Local::now().to_rfc2822()),
            ("Config", run.config.display().to_string()),
            ("Force", run.force.to_string()),
            ("Log level", config.log_level.clone()),
            ("Log file", log_path.display().to_string()),
            ("Source URL", url.to_string()),
            ("Source project", config.source_project.clone()),
        ],
    );

    let client = JiraClient::new(JiraSettings {
        url: url.to_string(),
        user: user.to_string(),
        password: password.to_string(),
        using_jira_cloud: config.using_jira_cloud,
    })
    .context("Failed to create Jira client")?;

    match client.server_info() {
        Ok(server) => info!("Jira {} ({})", server.version, server.deployment_type),
        Err(e) => warn!("Could not read server info: {}", e),
    }

    let field_ids = FieldIds::resolve(&config, &client).context("Failed to resolve field ids")?;
    let users = UserMapping::load(config.user_mapping_path().as_deref())
        .context("Failed to load user mapping")?;
    info!("{} user mappings loaded", users.len());

    std::fs::create_dir_all(config.attachments_dir()).with_context(|| {
        format!("Failed to create {}", config.attachments_dir().display())
    })?;

    let mut exporter = Exporter {
        config: &config,
        client: &client,
        mapper: Mapper::new(&config, users, &field_ids),
        provider: WiItemProvider::new(&config.workspace, config.sprints_dir()),
        build_settings: BuildSettings {
            epic_link_field: field_ids.get(&config.epic_link_field).map(str::to_string),
        },
    };

    let mut stats = ExportStats::default();
    let result = exporter
        .export_sprints(run.force, &mut stats)
        .and_then(|()| exporter.export_items(run.force, &mut stats));

    telemetry::log_banner(
        "Export finished",
        &[
            ("Items exported", stats.exported.to_string()),
            ("Items skipped", stats.skipped.to_string()),
            ("Items without changes", stats.empty.to_string()),
            ("Items failed", stats.failed.to_string()),
            ("Sprints exported", stats.sprints.to_string()),
            ("Elapsed", telemetry::format_elapsed(started.elapsed())),
            (
                "Result",
                format!("({} errors, {} warnings)", telemetry::errors(), telemetry::warnings()),
            ),
        ],
    );
    result
}

impl Exporter<'_> {
    fn export_sprints(&self, force: bool, stats: &mut ExportStats) -> Result<()> {
        let Some(board) = self.config.source_board_id.as_deref().filter(|b| !b.is_empty()) else {
            debug!("No source board configured, sprints not exported");
            return Ok(());
        };

        let existing = if force {
            HashSet::new()
        } else {
            self.provider.exported_iterations()?
        };
        let sprints = self
            .client
            .get_sprints(board)
            .with_context(|| format!("Failed to read sprints of board {board}"))?;
        info!("Exporting {} sprints of board {}", sprints.len(), board);

        for sprint in &sprints {
            if existing.contains(&sprint.name) {
                debug!("Sprint '{}' already exported, skipped", sprint.name);
                continue;
            }
            if let Some(iteration) = self.mapper.map_sprint(sprint) {
                self.provider.save_iteration(&iteration)?;
                stats.sprints += 1;
            }
        }
        Ok(())
    }

    fn export_items(&mut self, force: bool, stats: &mut ExportStats) -> Result<()> {
        let query = self.config.effective_query();
        let total = self.client.get_item_count(&query).context("Failed to count issues")?;
        info!("Query '{}' matched {} issues", query, total);

        let exported = if force {
            HashSet::new()
        } else {
            self.provider.exported_keys()?
        };
        let progress = progress::for_terminal("Export", total as u64);

        let mut seen: HashSet<String> = HashSet::new();
        let mut start_at = 0;
        loop {
            let page = self
                .client
                .search_keys(&query, start_at, self.config.batch_size)
                .with_context(|| format!("Failed to search issues from {start_at}"))?;
            if page.is_empty() {
                break;
            }
            start_at += page.len();

            let mut pending: VecDeque<String> = page.into();
            while let Some(key) = pending.pop_front() {
                if !seen.insert(key.clone()) {
                    continue;
                }
                progress.set_message(&key);
                if exported.contains(&key) {
                    debug!("{} already exported, skipped", key);
                    stats.skipped += 1;
                    progress.increment(1);
                    continue;
                }

                match self.export_item(&key) {
                    Ok(Some(item)) => {
                        stats.exported += 1;
                        for related in self.related_keys(&item) {
                            if !seen.contains(&related) {
                                debug!("Queued {} related to {}", related, key);
                                progress.grow(1);
                                pending.push_back(related);
                            }
                        }
                    }
                    Ok(None) => stats.empty += 1,
                    Err(e) if e.is_abort() => {
                        info!("Aborting export...");
                        progress.finish_with_message("aborted");
                        return Err(e.into());
                    }
                    Err(e) => {
                        error!("Failed to export {}: {}", key, e);
                        stats.failed += 1;
                    }
                }
                progress.increment(1);
            }

            if start_at >= total {
                break;
            }
        }

        progress.finish_with_message(&format!("{} exported", stats.exported));
        Ok(())
    }

    /// Build, download and persist one issue; `None` when it has no revisions
    fn export_item(&mut self, key: &str) -> workitem_migrator::Result<Option<SourceItem>> {
        info!("Exporting {}", key);
        let snapshot = self.client.get_issue(key)?;
        let changelog = self.client.get_changelog(key)?;
        let item = SourceItem::build(key, &snapshot, changelog, &self.build_settings)?;

        self.download_attachments(&item);

        match self.mapper.map_item(&item)? {
            Some(wi) => {
                self.provider.save(&wi)?;
                debug!("{} saved with {} revisions", key, wi.revisions.len());
                Ok(Some(item))
            }
            None => {
                warn!("{} has no changes to migrate", key);
                Ok(None)
            }
        }
    }

    /// Issues pulled into the export by the download options
    fn related_keys(&self, item: &SourceItem) -> Vec<String> {
        let mut keys = item.related_keys(self.config.download_options);
        if self.config.includes(download_options::INCLUDE_EPIC_CHILDREN) {
            match item.epic_children(self.client, &self.config.epic_link_field, self.config.batch_size) {
                Ok(children) => keys.extend(children),
                Err(e) => warn!("Failed to search children of epic {}: {}", item.key, e),
            }
        }
        keys
    }

    fn download_attachments(&self, item: &SourceItem) {
        let dir = self.config.attachments_dir();
        let added = item
            .revisions
            .iter()
            .flat_map(|r| r.attachment_actions.iter())
            .filter(|a| a.change == RevisionChangeType::Added)
            .map(|a| &a.value);

        for att in added {
            let dest = attachment_path(&dir, att);
            if dest.is_file() {
                continue;
            }
            let Some(url) = att.url.as_deref() else {
                warn!("Attachment {} of {} has no content URL", att, item.key);
                continue;
            };
            if let Err(e) = self.client.download_attachment(url, Path::new(&dest)) {
                warn!("Failed to download attachment {} of {}: {}", att, item.key, e);
            }
        }
    }
}
