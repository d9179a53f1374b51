// tests/pipeline.rs

//! Export-to-import pipeline: source snapshot and changelog through the mapper,
//! persisted records, and replay into the in-memory target.

mod common;

use common::*;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use workitem_migrator::mapper::{FieldIds, Mapper, UserMapping, attachment_path};
use workitem_migrator::model::{FieldValue, field_ref};
use workitem_migrator::replay::{ATTACHED_FILE_REL, InMemoryTarget, TargetConnector};
use workitem_migrator::source::{
    BuildSettings, ChangelogEntry, RevisionChangeType, ServerInfo, SourceConnector, SourceItem,
    SourceSprint,
};
use workitem_migrator::{ConfigFile, Error, Result};

/// Source connector serving canned issues
struct StaticSource {
    issues: HashMap<String, Value>,
    changelogs: HashMap<String, Value>,
}

impl SourceConnector for StaticSource {
    fn get_issue(&self, key: &str) -> Result<Value> {
        self.issues
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFoundError(key.to_string()))
    }

    fn get_changelog(&self, key: &str) -> Result<Vec<ChangelogEntry>> {
        let raw = self.changelogs.get(key).cloned().unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(raw)?)
    }

    fn get_custom_id(&self, field_name: &str) -> Result<Option<String>> {
        Ok((field_name == "Epic Link").then(|| "customfield_10008".to_string()))
    }

    fn get_sprints(&self, _board_id: &str) -> Result<Vec<SourceSprint>> {
        Ok(Vec::new())
    }

    fn search_keys(&self, _query: &str, start_at: usize, max_results: usize) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.issues.keys().cloned().collect();
        keys.sort();
        Ok(keys.into_iter().skip(start_at).take(max_results).collect())
    }

    fn get_item_count(&self, _query: &str) -> Result<usize> {
        Ok(self.issues.len())
    }

    fn download_attachment(&self, _url: &str, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest.parent().unwrap_or(dest))?;
        std::fs::write(dest, b"\x89PNG")?;
        Ok(())
    }

    fn server_info(&self) -> Result<ServerInfo> {
        Ok(ServerInfo::default())
    }
}

fn config(workspace: &Path) -> ConfigFile {
    serde_json::from_value(json!({
        "source-project": "PRJ",
        "target-project": "Proj",
        "workspace": workspace,
        "type-map": { "type": [{ "source": "Story", "target": "User Story" }] },
        "link-map": { "link": [{ "source": "blocks", "target": "System.LinkTypes.Dependency-Forward" }] },
        "field-map": { "field": [
            { "source": "summary", "target": "System.Title" },
            { "source": "status", "target": "System.State", "mapper": "MapValue",
              "mapping": { "values": [
                  { "source": "To Do", "target": "New" },
                  { "source": "Done", "target": "Done" }
              ] } },
            { "source": "assignee", "target": "System.AssignedTo", "mapper": "MapUser" },
            { "source": "description", "target": "System.Description", "mapper": "MapRendered" }
        ] }
    }))
    .unwrap()
}

fn source() -> StaticSource {
    let story = json!({
        "id": "10001",
        "key": "PRJ-1",
        "fields": {
            "issuetype": { "name": "Story" },
            "summary": "Checkout page",
            "status": { "name": "Done" },
            "created": "2023-01-01T10:00:00.000+0000",
            "reporter": { "accountId": "acc-1" },
            "assignee": { "accountId": "acc-2" },
            "description": "!pic.png!",
            "issuelinks": [
                { "type": { "name": "Blocks", "inward": "is blocked by", "outward": "blocks" },
                  "outwardIssue": { "key": "PRJ-2" } }
            ],
            "attachment": [{ "id": "9", "filename": "pic.png", "content": "https://jira/att/9" }]
        },
        "renderedFields": { "description": "<p><img src=\"pic.png\" /></p>" }
    });
    let task = json!({
        "id": "10002",
        "key": "PRJ-2",
        "fields": {
            "issuetype": { "name": "Task" },
            "summary": "Payment API",
            "status": { "name": "To Do" },
            "created": "2022-12-31T10:00:00.000+0000",
            "reporter": { "accountId": "acc-2" }
        },
        "renderedFields": {}
    });
    let story_changelog = json!([
        { "id": "1", "created": "2023-01-02T10:00:00.000+0000", "author": { "accountId": "acc-2" },
          "items": [{ "field": "status", "fieldId": "status", "fromString": "To Do", "toString": "Done" }] }
    ]);

    StaticSource {
        issues: HashMap::from([("PRJ-1".to_string(), story), ("PRJ-2".to_string(), task)]),
        changelogs: HashMap::from([("PRJ-1".to_string(), story_changelog)]),
    }
}

/// Export every issue the way the export command does, minus the network
fn export(config: &ConfigFile, source: &StaticSource, ctx: &workitem_migrator::MigrationContext) -> usize {
    let field_ids = FieldIds::resolve(config, source).unwrap();
    let users = UserMapping::parse("acc-1=ann@target\nacc-2=bob@target");
    let mut mapper = Mapper::new(config, users, &field_ids);
    let settings = BuildSettings {
        epic_link_field: field_ids.get(&config.epic_link_field).map(str::to_string),
    };

    let mut exported = 0;
    for key in source.search_keys(&config.effective_query(), 0, config.batch_size).unwrap() {
        let snapshot = source.get_issue(&key).unwrap();
        let changelog = source.get_changelog(&key).unwrap();
        let item = SourceItem::build(&key, &snapshot, changelog, &settings).unwrap();

        for rev in &item.revisions {
            for action in &rev.attachment_actions {
                if action.change == RevisionChangeType::Added {
                    let dest = attachment_path(&config.attachments_dir(), &action.value);
                    source.download_attachment("", &dest).unwrap();
                }
            }
        }

        if let Some(wi) = mapper.map_item(&item).unwrap() {
            ctx.provider.save(&wi).unwrap();
            exported += 1;
        }
    }
    exported
}

#[test]
fn test_exported_history_replays_into_target() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(temp.path());
    let mut ctx = open_context(temp.path(), false);
    let source = source();

    assert_eq!(export(&config, &source, &ctx), 2);
    assert_eq!(ctx.provider.exported_keys().unwrap().len(), 2);

    let target = InMemoryTarget::new("Proj");
    let summary = run_import(&mut ctx, &target, settings("Proj"));
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.incomplete, 0);
    assert_eq!(target.item_count(), 2);

    let task_id = ctx.journal.get_migrated_id("PRJ-2").unwrap();
    let story = target.item(ctx.journal.get_migrated_id("PRJ-1").unwrap()).unwrap();

    assert_eq!(story.field_text(field_ref::WORK_ITEM_TYPE), "User Story");
    assert_eq!(story.field_text(field_ref::TITLE), "Checkout page");
    assert_eq!(story.field_text(field_ref::STATE), "Done");
    assert_eq!(
        story.field(field_ref::ASSIGNED_TO),
        Some(&FieldValue::Identity("bob@target".into()))
    );
    assert!(matches!(story.field(field_ref::CLOSED_DATE), Some(FieldValue::Date(_))));

    let link = story
        .relations
        .iter()
        .find(|r| r.rel == "System.LinkTypes.Dependency-Forward")
        .unwrap();
    assert_eq!(link.url, target.work_item_url(task_id));

    let attachment = story.relations.iter().find(|r| r.rel == ATTACHED_FILE_REL).unwrap();
    assert_eq!(ctx.journal.is_attachment_migrated("9"), Some(attachment.url.as_str()));
    assert!(
        story
            .field_text(field_ref::DESCRIPTION)
            .contains(&format!("src=\"{}\"", attachment.url))
    );
}

#[test]
fn test_unmapped_changes_are_dropped_from_history() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = config(temp.path());
    config.field_map.fields.clear();
    let ctx = open_context(temp.path(), false);

    // Revision 0 still carries the work item type
    assert_eq!(export(&config, &source(), &ctx), 2);
    let story = ctx.provider.load("PRJ-1").unwrap();
    assert_eq!(story.revisions.len(), 1);
    assert_eq!(story.wi_type, "User Story");
}
