// src/commands/status.rs
//! Workspace status command

use super::load_config;
use anyhow::{Context, Result};
use std::path::Path;
use workitem_migrator::journal::{JOURNAL_FILE_NAME, JournalRecord, read_records};
use workitem_migrator::model::WiItemProvider;
use workitem_migrator::plan::ExecutionPlan;

/// Show exported items, planned revisions and journal progress
///
/// Reads the journal without locking it, so it can run next to an import.
pub fn cmd_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let provider = WiItemProvider::new(&config.workspace, config.sprints_dir());

    let items = provider
        .enumerate_all_items()
        .context("Failed to read exported items")?;
    let plan = ExecutionPlan::build(items);
    let iterations = provider.exported_iterations().unwrap_or_default();

    let journal_path = config.workspace.join(JOURNAL_FILE_NAME);
    let records = if journal_path.exists() {
        read_records(&journal_path)
            .with_context(|| format!("Failed to read {}", journal_path.display()))?
    } else {
        Vec::new()
    };

    let mut created = 0;
    let mut processed = 0;
    let mut attachments = 0;
    let mut sessions = 0;
    for record in &records {
        match record {
            JournalRecord::Session { .. } => sessions += 1,
            JournalRecord::ItemMigrated { .. } => created += 1,
            JournalRecord::RevisionProcessed { .. } => processed += 1,
            JournalRecord::AttachmentMigrated { .. } => attachments += 1,
        }
    }

    println!("Workspace: {}", config.workspace.display());
    println!("  Exported items:      {}", plan.item_count());
    println!("  Exported revisions:  {}", plan.revision_count());
    println!("  Exported sprints:    {}", iterations.len());
    println!("Journal: {}", journal_path.display());
    println!("  Sessions:            {}", sessions);
    println!("  Items created:       {}", created);
    println!("  Revisions processed: {}", processed);
    println!("  Attachments:         {}", attachments);
    if plan.revision_count() > 0 {
        println!(
            "  Progress:            {:.1}%",
            processed as f64 * 100.0 / plan.revision_count() as f64
        );
    }
    Ok(())
}
