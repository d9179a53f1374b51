// tests/common/mod.rs

//! Shared workspace, item and replay helpers for integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use workitem_migrator::model::{
    FieldValue, ReferenceChangeType, WiAttachment, WiField, WiItem, WiLink, WiRevision, field_ref,
};
use workitem_migrator::replay::TargetConnector;
use workitem_migrator::{Agent, AgentSettings, ExecutionPlan, ImportOutcome, MigrationContext};

/// Open a migration context rooted in `dir`
pub fn open_context(dir: &Path, force_fresh: bool) -> MigrationContext {
    MigrationContext::open_workspace(
        "wi-import-test",
        dir,
        dir.join("Attachments"),
        dir.join("Sprints"),
        force_fresh,
    )
    .unwrap()
}

/// A fresh workspace; keep the TempDir alive for the duration of the test.
pub fn workspace() -> (TempDir, MigrationContext) {
    let temp = tempfile::tempdir().unwrap();
    let ctx = open_context(temp.path(), false);
    (temp, ctx)
}

/// Test timestamp `secs` seconds after a fixed origin
pub fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 6, 1, 8, 0, 0).unwrap() + ChronoDuration::seconds(secs)
}

/// Agent settings without pauses
pub fn settings(project: &str) -> AgentSettings {
    AgentSettings {
        retry_pause: Duration::ZERO,
        poll_interval: Duration::ZERO,
        poll_timeout: Duration::ZERO,
        ..AgentSettings::new(project)
    }
}

/// A revision with a title and optional extra fields
pub fn revision(index: usize, secs: i64, fields: &[(&str, FieldValue)]) -> WiRevision {
    let mut rev = WiRevision::new(index, t(secs), "ann@target");
    for (name, value) in fields {
        rev.fields.push(WiField::new(*name, value.clone()));
    }
    rev
}

/// A persisted item with a created revision at `secs`
pub fn item(origin_id: &str, wi_type: &str, secs: i64) -> WiItem {
    let mut item = WiItem::new(origin_id, wi_type);
    item.revisions.push(revision(
        0,
        secs,
        &[(field_ref::TITLE, FieldValue::from(format!("{origin_id} title")))],
    ));
    item
}

pub fn link(change: ReferenceChangeType, source: &str, target: &str) -> WiLink {
    WiLink {
        change,
        source_origin_id: source.into(),
        target_origin_id: target.into(),
        wi_type: "System.LinkTypes.Related".into(),
    }
}

/// Write attachment content into the workspace and describe it
pub fn attachment(ctx: &MigrationContext, id: &str, name: &str) -> WiAttachment {
    let path = ctx.attachments_dir().join(id).join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"content").unwrap();
    WiAttachment {
        change: ReferenceChangeType::Added,
        att_origin_id: id.into(),
        file_path: path.display().to_string(),
        file_name: name.into(),
        comment: Some("Imported".into()),
    }
}

pub fn save_all(ctx: &MigrationContext, items: &[WiItem]) {
    for item in items {
        let mut item = item.clone();
        item.link_revisions();
        ctx.provider.save(&item).unwrap();
    }
}

/// Outcome counts of one replay run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub complete: usize,
    pub incomplete: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Replay the whole workspace the way the import command does
pub fn run_import(ctx: &mut MigrationContext, target: &dyn TargetConnector, settings: AgentSettings) -> RunSummary {
    run_import_limited(ctx, target, settings, usize::MAX)
}

/// Replay at most `limit` unprocessed revisions, simulating an interrupted run
pub fn run_import_limited(
    ctx: &mut MigrationContext,
    target: &dyn TargetConnector,
    settings: AgentSettings,
    limit: usize,
) -> RunSummary {
    let agent = Agent::initialize(target, settings, &|_: &str| true).unwrap();
    let mut plan = ExecutionPlan::build(ctx.enumerate_all_items().unwrap());
    let mut summary = RunSummary::default();
    let mut done = 0;

    while let Some(exec) = plan.try_pop(&ctx.journal) {
        if ctx.journal.is_item_migrated(&exec.origin_id, exec.revision.index) {
            summary.skipped += 1;
            continue;
        }
        if done == limit {
            break;
        }
        match agent.import(ctx, &exec).unwrap() {
            ImportOutcome::Complete => summary.complete += 1,
            ImportOutcome::Incomplete => summary.incomplete += 1,
            ImportOutcome::Failed => summary.failed += 1,
        }
        done += 1;
    }
    summary
}
