// src/mapper/mod.rs

//! Source revision to target-agnostic revision mapping
//!
//! The mapper is the boundary where loosely-typed source values become typed
//! [`FieldValue`]s keyed by target reference names. It also resolves user
//! identities, translates link types, and places attachment content in the
//! workspace.

mod fields;
mod user;

pub use user::{DEFAULT_USER_KEY, UserMapping};

use crate::config::{ConfigFile, FieldRule, MapperKind, SourceType};
use crate::model::{
    FieldValue, ReferenceChangeType, WiAttachment, WiField, WiItem, WiIteration, WiLink,
    WiRevision, field_ref, has_any_by_ref_name,
};
use crate::source::{
    RevisionAction, RevisionChangeType, SourceAttachment, SourceConnector, SourceItem, SourceLink,
    SourceRevision, SourceSprint,
};
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Display-name fields resolved to source field ids
#[derive(Debug, Clone, Default)]
pub struct FieldIds {
    ids: HashMap<String, String>,
}

impl FieldIds {
    pub fn new(ids: HashMap<String, String>) -> Self {
        Self { ids }
    }

    /// Resolve every name the configuration refers to
    pub fn resolve(config: &ConfigFile, connector: &dyn SourceConnector) -> Result<Self> {
        let mut names: Vec<&str> = config
            .field_map
            .fields
            .iter()
            .filter(|r| r.source_type == SourceType::Name)
            .map(|r| r.source.as_str())
            .collect();
        names.push(&config.epic_link_field);
        names.push(&config.sprint_field);

        let mut ids = HashMap::new();
        for name in names {
            match connector.get_custom_id(name)? {
                Some(id) => {
                    ids.insert(name.to_string(), id);
                }
                None => warn!("Field '{}' not found in the source, rules using it are skipped", name),
            }
        }
        Ok(Self { ids })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.ids.get(name).map(String::as_str)
    }
}

/// A rule with its source key resolved
#[derive(Debug, Clone)]
struct ResolvedRule {
    source_key: String,
    rule: FieldRule,
}

/// Path of an attachment's content inside the workspace
pub fn attachment_path(attachments_dir: &Path, att: &SourceAttachment) -> PathBuf {
    attachments_dir.join(&att.id).join(&att.file_name)
}

/// Maps source items into persisted revision records
pub struct Mapper {
    config: ConfigFile,
    users: UserMapping,
    rules: Vec<ResolvedRule>,
    sprint_field: Option<String>,
    attachments_dir: PathBuf,
}

impl Mapper {
    pub fn new(config: &ConfigFile, users: UserMapping, field_ids: &FieldIds) -> Self {
        let rules = config
            .field_map
            .fields
            .iter()
            .filter_map(|rule| {
                let source_key = match rule.source_type {
                    SourceType::Id => rule.source.clone(),
                    SourceType::Name => field_ids.get(&rule.source)?.to_string(),
                };
                Some(ResolvedRule {
                    source_key,
                    rule: rule.clone(),
                })
            })
            .collect();

        Self {
            config: config.clone(),
            users,
            rules,
            sprint_field: field_ids.get(&config.sprint_field).map(str::to_string),
            attachments_dir: config.attachments_dir(),
        }
    }

    /// Rules for a target type: base rules first, then type rules, first wins per target
    fn rules_for(&self, wi_type: &str) -> Vec<&ResolvedRule> {
        let base = self.rules.iter().filter(|r| r.rule.is_base());
        let specific = self
            .rules
            .iter()
            .filter(|r| !r.rule.is_base() && r.rule.is_for(wi_type));

        let mut merged: Vec<&ResolvedRule> = Vec::new();
        for rule in base.chain(specific) {
            if rule.rule.is_excluded(wi_type) {
                continue;
            }
            if merged.iter().any(|m| m.rule.target == rule.rule.target) {
                continue;
            }
            merged.push(rule);
        }
        merged
    }

    /// Map an item; returns `None` when no revision carries a change
    pub fn map_item(&mut self, item: &SourceItem) -> Result<Option<WiItem>> {
        if item.key.is_empty() {
            return Err(Error::invalid_argument("item has no key"));
        }

        let wi_type = self.config.map_type(&item.issue_type);
        let mut wi_item = WiItem::new(&item.key, &wi_type);

        for index in 0..item.revisions.len() {
            let Some(mut revision) = self.map_revision(item, index)? else {
                debug!("Revision {} of '{}' has no changes, skipped", index, item.key);
                continue;
            };
            revision.index = wi_item.revisions.len();
            wi_item.revisions.push(revision);
        }
        wi_item.link_revisions();

        if wi_item.revisions.is_empty() {
            warn!("'{}' has no mappable revisions", item.key);
            return Ok(None);
        }
        Ok(Some(wi_item))
    }

    /// Map one revision; `None` when it carries nothing to replay
    pub fn map_revision(&mut self, item: &SourceItem, index: usize) -> Result<Option<WiRevision>> {
        let rev = item.revisions.get(index).ok_or_else(|| {
            Error::invalid_argument(format!("'{}' has no revision {}", item.key, index))
        })?;

        let wi_type = self.config.map_type(&item.issue_type);
        let mut fields = self.map_fields(item, rev, &wi_type);
        let links = self.map_links(rev);
        let attachments = self.map_attachments(&item.key, rev);

        if index == 0 {
            fields.push(WiField::new(field_ref::WORK_ITEM_TYPE, wi_type));
        }
        if fields.is_empty() && links.is_empty() && attachments.is_empty() {
            return Ok(None);
        }

        let author = rev
            .author
            .as_deref()
            .map(|a| self.users.map_user(a))
            .unwrap_or_default();

        let mut revision = WiRevision::new(rev.index, rev.time, author);
        revision.parent_origin_id = item.key.clone();
        revision.attachment_references = references_attachments(item, index, &fields);
        revision.fields = fields;
        revision.links = links;
        revision.attachments = attachments;
        Ok(Some(revision))
    }

    pub fn map_fields(&mut self, item: &SourceItem, rev: &SourceRevision, wi_type: &str) -> Vec<WiField> {
        let rules: Vec<ResolvedRule> = self.rules_for(wi_type).into_iter().cloned().collect();
        let mut fields = Vec::new();

        for resolved in rules {
            let Some(value) = rev.fields.get(&resolved.source_key) else {
                continue;
            };
            let rule = &resolved.rule;
            let mapped = match rule.mapper {
                MapperKind::Identity => Some(fields::map_identity(value)),
                MapperKind::MapValue => Some(fields::map_value(value, rule.mapping.as_ref())),
                MapperKind::MapUser => Some(match fields::value_text(value) {
                    Some(user) if !user.is_empty() => FieldValue::Identity(self.users.map_user(&user)),
                    _ => FieldValue::Empty,
                }),
                MapperKind::MapTags => Some(fields::map_tags(value)),
                MapperKind::MapArray => Some(fields::map_array(value)),
                MapperKind::MapSprint => Some(fields::map_sprint(value)),
                MapperKind::MapNumber => fields::map_number(value),
                MapperKind::MapDate => fields::map_date(value),
                MapperKind::MapRendered => {
                    // Rendered HTML only describes the final value
                    let current = item
                        .revisions
                        .last()
                        .and_then(|last| item.get_field_value(last.index, &resolved.source_key));
                    let rendered = (current == Some(value))
                        .then(|| item.rendered.get(&resolved.source_key))
                        .flatten();
                    fields::map_rendered(value, rendered.map(String::as_str))
                }
            };
            if let Some(value) = mapped {
                fields.push(WiField {
                    reference_name: rule.target.clone(),
                    value,
                });
            }
        }

        // The sprint field maps to the iteration path without an explicit rule
        if let Some(sprint_key) = &self.sprint_field
            && let Some(value) = rev.fields.get(sprint_key)
            && !has_any_by_ref_name(Some(&fields), field_ref::ITERATION_PATH)
        {
            fields.push(WiField {
                reference_name: field_ref::ITERATION_PATH.to_string(),
                value: fields::map_sprint(value),
            });
        }

        fields
    }

    pub fn map_links(&self, rev: &SourceRevision) -> Vec<WiLink> {
        rev.link_actions
            .iter()
            .filter_map(|action| self.map_link(action))
            .collect()
    }

    fn map_link(&self, action: &RevisionAction<SourceLink>) -> Option<WiLink> {
        let link = &action.value;
        let Some(pair) = self
            .config
            .link_map
            .links
            .iter()
            .find(|l| l.source.eq_ignore_ascii_case(&link.link_type))
        else {
            warn!("Link type '{}' is not mapped, dropping {}", link.link_type, link);
            return None;
        };
        Some(WiLink {
            change: change_type(action.change),
            source_origin_id: link.source_key.clone(),
            target_origin_id: link.target_key.clone(),
            wi_type: pair.target.clone(),
        })
    }

    pub fn map_attachments(&self, key: &str, rev: &SourceRevision) -> Vec<WiAttachment> {
        rev.attachment_actions
            .iter()
            .map(|action| {
                let att = &action.value;
                WiAttachment {
                    change: change_type(action.change),
                    att_origin_id: att.id.clone(),
                    file_path: attachment_path(&self.attachments_dir, att)
                        .to_string_lossy()
                        .into_owned(),
                    file_name: att.file_name.clone(),
                    comment: Some(format!("Imported from {key}")),
                }
            })
            .collect()
    }

    /// Map a board sprint to an iteration record
    pub fn map_sprint(&self, sprint: &SourceSprint) -> Option<WiIteration> {
        if sprint.name.trim().is_empty() {
            warn!("Sprint {} has no name, skipped", sprint.origin_id);
            return None;
        }
        Some(WiIteration {
            name: sprint.name.clone(),
            origin_id: Some(sprint.origin_id.clone()),
            state: sprint.state.clone(),
            goal: sprint.goal.clone(),
            start_date: sprint.start_date.or(sprint.activated_date),
            end_date: sprint.end_date.or(sprint.completed_date),
        })
    }
}

fn change_type(change: RevisionChangeType) -> ReferenceChangeType {
    match change {
        RevisionChangeType::Added => ReferenceChangeType::Added,
        RevisionChangeType::Removed => ReferenceChangeType::Removed,
    }
}

/// True if a rich-text value mentions an attachment added at or before `index`
fn references_attachments(item: &SourceItem, index: usize, fields: &[WiField]) -> bool {
    let names: Vec<&str> = item
        .revisions
        .iter()
        .filter(|r| r.index <= index)
        .flat_map(|r| r.attachment_actions.iter())
        .filter(|a| a.change == RevisionChangeType::Added)
        .map(|a| a.value.file_name.as_str())
        .filter(|n| !n.is_empty())
        .collect();
    fields.iter().any(|f| {
        f.value
            .as_str()
            .is_some_and(|text| names.iter().any(|n| text.contains(n)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::BuildSettings;
    use serde_json::json;

    fn config() -> ConfigFile {
        serde_json::from_value(json!({
            "source-project": "PRJ",
            "workspace": "/tmp/ws",
            "type-map": { "type": [{ "source": "Story", "target": "User Story" }] },
            "link-map": { "link": [{ "source": "blocks", "target": "System.LinkTypes.Dependency-Forward" }] },
            "field-map": { "field": [
                { "source": "summary", "target": "System.Title" },
                { "source": "status", "target": "System.State", "mapper": "MapValue",
                  "mapping": { "values": [{ "source": "To Do", "target": "New" }] } },
                { "source": "labels", "target": "System.State", "for": "User Story" },
                { "source": "assignee", "target": "System.AssignedTo", "mapper": "MapUser" },
                { "source": "description", "target": "System.Description", "mapper": "MapRendered" },
                { "source": "Story Points", "source-type": "name", "target": "Microsoft.VSTS.Scheduling.StoryPoints",
                  "mapper": "MapNumber", "not-for": "Bug" },
                { "source": "customfield_20000", "target": "Custom.Unresolved", "source-type": "name" }
            ] }
        }))
        .unwrap()
    }

    fn item() -> SourceItem {
        let snapshot = json!({
            "id": "1",
            "fields": {
                "issuetype": { "name": "Story" },
                "summary": "Title",
                "status": { "name": "To Do" },
                "labels": ["x"],
                "created": "2023-01-01T10:00:00.000+0000",
                "reporter": { "accountId": "acc-1" },
                "assignee": { "accountId": "acc-2" },
                "customfield_10016": 5,
                "description": "see pic.png",
                "issuelinks": [
                    { "type": { "name": "Blocks", "inward": "is blocked by", "outward": "blocks" },
                      "outwardIssue": { "key": "PRJ-2" } },
                    { "type": { "name": "Cloners", "inward": "is cloned by", "outward": "clones" },
                      "outwardIssue": { "key": "PRJ-3" } }
                ],
                "attachment": [{ "id": "9", "filename": "pic.png", "content": "https://jira/att/9" }]
            },
            "renderedFields": { "description": "<p>see pic.png</p>" }
        });
        let changelog = serde_json::from_value(json!([
            { "id": "1", "created": "2023-01-02T10:00:00.000+0000", "author": { "accountId": "acc-2" },
              "items": [{ "field": "watchers", "fieldId": "watches", "toString": "1" }] },
            { "id": "2", "created": "2023-01-03T10:00:00.000+0000", "author": { "accountId": "acc-2" },
              "items": [{ "field": "assignee", "fieldId": "assignee", "from": "acc-2", "to": null }] }
        ]))
        .unwrap();
        SourceItem::build("PRJ-1", &snapshot, changelog, &BuildSettings::default()).unwrap()
    }

    fn mapper() -> Mapper {
        let ids = FieldIds::new(HashMap::from([(
            "Story Points".to_string(),
            "customfield_10016".to_string(),
        )]));
        Mapper::new(&config(), UserMapping::parse("acc-1=ann@target\nacc-2=bob@target"), &ids)
    }

    #[test]
    fn test_map_item_type_and_reindexing() {
        let mut mapper = mapper();
        let wi_item = mapper.map_item(&item()).unwrap().unwrap();

        assert_eq!(wi_item.wi_type, "User Story");
        // The watchers-only revision maps to nothing and is dropped
        assert_eq!(wi_item.revisions.len(), 2);
        assert_eq!(wi_item.revisions[1].index, 1);
        assert!(wi_item.revisions.iter().all(|r| r.parent_origin_id == "PRJ-1"));
    }

    #[test]
    fn test_first_revision_fields() {
        let mut mapper = mapper();
        let rev = mapper.map_revision(&item(), 0).unwrap().unwrap();
        let value = |name: &str| crate::model::field_value(&rev.fields, name).cloned();

        assert_eq!(rev.author, "ann@target");
        assert_eq!(value("System.Title"), Some(FieldValue::String("Title".into())));
        // Base rule wins over the type rule for the same target
        assert_eq!(value("System.State"), Some(FieldValue::String("New".into())));
        assert_eq!(value("System.AssignedTo"), Some(FieldValue::Identity("bob@target".into())));
        assert_eq!(
            value("Microsoft.VSTS.Scheduling.StoryPoints"),
            Some(FieldValue::Number(5.0))
        );
        assert_eq!(value(field_ref::WORK_ITEM_TYPE), Some(FieldValue::String("User Story".into())));
        assert_eq!(
            value("System.Description"),
            Some(FieldValue::String("<p>see pic.png</p>".into()))
        );
        assert!(rev.attachment_references);
        assert_eq!(value("Custom.Unresolved"), None);
    }

    #[test]
    fn test_rendered_html_only_for_final_value() {
        let snapshot = json!({
            "id": "1",
            "fields": {
                "issuetype": { "name": "Story" },
                "created": "2023-01-01T10:00:00.000+0000",
                "reporter": { "accountId": "acc-1" },
                "description": "see pic.png"
            },
            "renderedFields": { "description": "<p>see pic.png</p>" }
        });
        let changelog = serde_json::from_value(json!([
            { "id": "1", "created": "2023-01-02T10:00:00.000+0000", "author": { "accountId": "acc-2" },
              "items": [{ "field": "description", "fieldId": "description",
                          "fromString": "draft", "toString": "see pic.png" }] }
        ]))
        .unwrap();
        let item = SourceItem::build("PRJ-1", &snapshot, changelog, &BuildSettings::default()).unwrap();

        let mut mapper = mapper();
        let description = |rev: &WiRevision| {
            crate::model::field_value(&rev.fields, "System.Description")
                .and_then(FieldValue::as_str)
                .map(str::to_string)
        };
        let first = mapper.map_revision(&item, 0).unwrap().unwrap();
        let second = mapper.map_revision(&item, 1).unwrap().unwrap();
        assert!(description(&first).is_some_and(|d| d.contains("draft")));
        assert_eq!(description(&second).as_deref(), Some("<p>see pic.png</p>"));
    }

    #[test]
    fn test_links_and_attachments() {
        let mut mapper = mapper();
        let rev = mapper.map_revision(&item(), 0).unwrap().unwrap();

        // The unmapped "clones" link is dropped
        assert_eq!(rev.links.len(), 1);
        assert_eq!(rev.links[0].target_origin_id, "PRJ-2");
        assert_eq!(rev.links[0].wi_type, "System.LinkTypes.Dependency-Forward");

        assert_eq!(rev.attachments.len(), 1);
        assert_eq!(rev.attachments[0].reference_name(), "pic.png");
        assert!(rev.attachments[0].file_path.ends_with("pic.png"));
    }

    #[test]
    fn test_cleared_user_is_explicit_empty() {
        let mut mapper = mapper();
        let rev = mapper.map_revision(&item(), 2).unwrap().unwrap();
        assert_eq!(rev.fields.len(), 1);
        assert_eq!(rev.fields[0].value, FieldValue::Empty);
    }

    #[test]
    fn test_empty_revision_maps_to_none() {
        let mut mapper = mapper();
        assert!(mapper.map_revision(&item(), 1).unwrap().is_none());
    }

    #[test]
    fn test_missing_revision_is_invalid_argument() {
        let mut mapper = mapper();
        let err = mapper.map_revision(&item(), 42).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_map_sprint() {
        let mapper = mapper();
        let sprint = SourceSprint {
            origin_id: "7".into(),
            origin_board_id: None,
            name: "Sprint 7".into(),
            state: Some("closed".into()),
            goal: None,
            start_date: None,
            end_date: None,
            activated_date: Some(chrono::Utc::now()),
            completed_date: None,
        };
        let iteration = mapper.map_sprint(&sprint).unwrap();
        assert_eq!(iteration.name, "Sprint 7");
        assert!(iteration.start_date.is_some());
    }
}
