// src/commands/import.rs
//! Azure DevOps import command

use super::{confirm, load_config};
use crate::cli::RunArgs;
use anyhow::{Context, Result};
use std::time::Instant;
use tracing::{debug, info};
use workitem_migrator::plan::ExecutionPlan;
use workitem_migrator::progress::{self, ProgressTracker};
use workitem_migrator::replay::{AdoClient, AdoSettings, InMemoryTarget, TargetConnector};
use workitem_migrator::{Agent, AgentSettings, ImportOutcome, MigrationContext, telemetry};

const APP: &str = "wi-import";

#[derive(Debug, Default)]
struct ImportStats {
    complete: usize,
    incomplete: usize,
    failed: usize,
    skipped: usize,
}

/// Replay the workspace into the target project
pub fn cmd_import(run: &RunArgs, url: &str, token: &str, dry_run: bool) -> Result<()> {
    let config = load_config(&run.config)?;
    let log_path = telemetry::init(APP, &config.workspace, &config.log_level, run.continue_on_critical)
        .context("Failed to initialize logging")?;
    let started = Instant::now();

    let mut ctx = MigrationContext::open(APP, &config, run.force)
        .with_context(|| format!("Failed to open workspace {}", config.workspace.display()))?;
    let session = uuid::Uuid::new_v4().to_string();
    ctx.journal
        .begin_session(&session, APP)
        .context("Failed to start journal session")?;

    telemetry::log_banner(
        "Import started",
        &[
            ("Tool version", env!("CARGO_PKG_VERSION").to_string()),
            ("Session", session.clone()),
            ("Start time", chrono::Local::now().to_rfc2822()),
            ("Config", run.config.display().to_string()),
            ("Force", run.force.to_string()),
            ("Log level", config.log_level.clone()),
            ("Log file", log_path.display().to_string()),
            ("Machine", hostname()),
            ("Target URL", url.to_string()),
            ("Hosting type", telemetry::hosting_type(url).to_string()),
            ("Dry run", dry_run.to_string()),
        ],
    );

    let target: Box<dyn TargetConnector> = if dry_run {
        Box::new(InMemoryTarget::new(config.target_project.clone()))
    } else {
        Box::new(
            AdoClient::new(AdoSettings {
                url: url.to_string(),
                project: config.target_project.clone(),
                token: token.to_string(),
            })
            .context("Failed to create Azure DevOps client")?,
        )
    };
    let always = |_: &str| true;
    let ask: &dyn Fn(&str) -> bool = if dry_run { &always } else { &confirm };
    let agent = Agent::initialize(target.as_ref(), AgentSettings::from_config(&config), ask)
        .context("Failed to initialize the import agent")?;

    let items = ctx.enumerate_all_items().context("Failed to read exported items")?;
    let mut plan = ExecutionPlan::build(items);
    info!(
        "Import plan: {} items, {} revisions, {} already processed",
        plan.item_count(),
        plan.revision_count(),
        ctx.journal.processed_count()
    );

    let progress = progress::for_terminal("Import", plan.revision_count() as u64);
    let mut stats = ImportStats::default();
    let mut aborted = false;

    while let Some(exec) = plan.try_pop(&ctx.journal) {
        progress.set_message(&exec.to_string());
        if ctx.journal.is_item_migrated(&exec.origin_id, exec.revision.index) {
            debug!("Skipped processed revision {}", exec);
            stats.skipped += 1;
            progress.increment(1);
            continue;
        }

        match agent.import(&mut ctx, &exec) {
            Ok(ImportOutcome::Complete) => stats.complete += 1,
            Ok(ImportOutcome::Incomplete) => stats.incomplete += 1,
            Ok(ImportOutcome::Failed) => stats.failed += 1,
            Err(e) if e.is_abort() => {
                info!("Aborting migration...");
                aborted = true;
                break;
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to import {exec}")),
        }
        progress.increment(1);
    }
    progress.finish_with_message(if aborted { "aborted" } else { "done" });

    telemetry::log_banner(
        "Import finished",
        &[
            ("Revisions complete", stats.complete.to_string()),
            ("Revisions incomplete", stats.incomplete.to_string()),
            ("Revisions failed", stats.failed.to_string()),
            ("Revisions skipped", stats.skipped.to_string()),
            ("Revisions remaining", plan.remaining().to_string()),
            ("Elapsed", telemetry::format_elapsed(started.elapsed())),
            (
                "Result",
                format!("({} errors, {} warnings)", telemetry::errors(), telemetry::warnings()),
            ),
        ],
    );

    if aborted {
        anyhow::bail!("Migration aborted after a critical error");
    }
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
