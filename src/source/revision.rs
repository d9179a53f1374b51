// src/source/revision.rs

//! Revision history reconstruction
//!
//! The source only exposes the current state of an issue plus a changelog of
//! per-field transitions. The history is rebuilt by undoing the changelog,
//! newest first, against the current snapshot: what remains is the creation
//! state (revision 0). Each changelog entry and each comment then becomes one
//! sparse revision carrying only the values it set.

use super::utility::next_valid_delta_rev;
use super::{ChangelogEntry, ChangelogItem, SourceConnector, SourceUser, parse_source_date};
use crate::config::download_options;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Link type tag used for epic membership
pub const EPIC_LINK_TYPE: &str = "Epic";
/// Link type tag used for parent/sub-task membership
pub const PARENT_LINK_TYPE: &str = "Parent";
/// Field key under which comments appear in revisions
pub const COMMENT_FIELD: &str = "comment";

/// Snapshot keys that are not plain field values
const STRUCTURAL_FIELDS: &[&str] = &[
    "attachment",
    "issuelinks",
    "comment",
    "worklog",
    "subtasks",
    "watches",
    "votes",
    "parent",
    "project",
    "lastViewed",
    "updated",
    "progress",
    "aggregateprogress",
    "timetracking",
    "statuscategorychangedate",
];

/// Changelog fields whose raw value (not display string) is the identity
const IDENTITY_FIELDS: &[&str] = &["assignee", "reporter", "creator"];

static SERVER_SPRINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"com\.atlassian\.greenhopper\..*\[.*name=([^,\]]+)").expect("static pattern")
});

static LINK_PHRASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^This issue (.+) (\S+)$").expect("static pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionChangeType {
    Added,
    Removed,
}

/// An add or remove of a link or attachment
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionAction<T> {
    pub change: RevisionChangeType,
    pub value: T,
}

impl<T: fmt::Display> fmt::Display for RevisionAction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.change, self.value)
    }
}

/// A link between two issues, by key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLink {
    pub source_key: String,
    pub target_key: String,
    /// Link phrase (`blocks`, `relates to`) or `Epic` / `Parent`
    pub link_type: String,
}

impl fmt::Display for SourceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.source_key, self.link_type, self.target_key)
    }
}

/// An issue attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAttachment {
    pub id: String,
    pub file_name: String,
    /// Content URL; unknown for attachments deleted before export
    pub url: Option<String>,
}

impl fmt::Display for SourceAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.file_name)
    }
}

/// One reconstructed revision
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRevision {
    pub index: usize,
    pub time: DateTime<Utc>,
    pub author: Option<String>,
    /// Values set by this revision; `Value::Null` clears the field
    pub fields: BTreeMap<String, Value>,
    pub link_actions: Vec<RevisionAction<SourceLink>>,
    pub attachment_actions: Vec<RevisionAction<SourceAttachment>>,
}

impl SourceRevision {
    fn new(index: usize, time: DateTime<Utc>, author: Option<String>) -> Self {
        Self {
            index,
            time,
            author,
            fields: BTreeMap::new(),
            link_actions: Vec::new(),
            attachment_actions: Vec::new(),
        }
    }
}

/// Field ids resolved from configured display names
#[derive(Debug, Clone, Default)]
pub struct BuildSettings {
    pub epic_link_field: Option<String>,
}

/// An issue and its reconstructed history
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub key: String,
    pub id: String,
    pub issue_type: String,
    pub revisions: Vec<SourceRevision>,
    /// HTML rendering of the current rich-text values
    pub rendered: BTreeMap<String, String>,
    fields: Map<String, Value>,
    epic_link_field: Option<String>,
}

/// Timeline event, ordered by creation time
enum Event<'a> {
    Change(&'a ChangelogEntry),
    Comment {
        author: Option<String>,
        body: String,
        created: DateTime<Utc>,
    },
}

impl Event<'_> {
    fn created(&self) -> DateTime<Utc> {
        match self {
            Self::Change(entry) => entry.created,
            Self::Comment { created, .. } => *created,
        }
    }
}

impl SourceItem {
    /// Rebuild the revision history of `key` from its snapshot and changelog
    pub fn build(
        key: &str,
        snapshot: &Value,
        mut changelog: Vec<ChangelogEntry>,
        settings: &BuildSettings,
    ) -> Result<Self> {
        let fields = snapshot
            .get("fields")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| Error::ParseError(format!("Issue '{key}' has no fields")))?;

        let issue_type = fields
            .get("issuetype")
            .and_then(|t| t.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let created = fields
            .get("created")
            .and_then(Value::as_str)
            .map(parse_source_date)
            .transpose()?
            .unwrap_or_else(|| changelog.first().map(|c| c.created).unwrap_or_else(Utc::now));
        let reporter = fields
            .get("reporter")
            .or_else(|| fields.get("creator"))
            .and_then(user_identity);

        let epic_field = settings.epic_link_field.as_deref();
        let mut current = current_values(&fields, epic_field);
        let mut links = current_links(key, &fields, epic_field);
        let mut attachments = current_attachments(&fields);

        changelog.sort_by(|a, b| a.created.cmp(&b.created));

        // Undo the changelog, newest first, to recover the creation state
        for entry in changelog.iter().rev() {
            for item in entry.items.iter().rev() {
                undo_item(key, item, epic_field, &mut current, &mut links, &mut attachments);
            }
        }

        let mut first = SourceRevision::new(0, created, reporter);
        first.fields = current.into_iter().filter(|(_, v)| !v.is_null()).collect();
        first.link_actions = links
            .into_iter()
            .map(|value| RevisionAction {
                change: RevisionChangeType::Added,
                value,
            })
            .collect();
        first.attachment_actions = attachments
            .into_iter()
            .map(|value| RevisionAction {
                change: RevisionChangeType::Added,
                value,
            })
            .collect();

        let all_attachments = current_attachments(&fields);
        let mut events: Vec<Event<'_>> = changelog.iter().map(Event::Change).collect();
        events.extend(comment_events(&fields)?);
        events.sort_by_key(Event::created);

        let mut revisions = vec![first];
        for event in events {
            let previous = revisions.last().map(|r| r.time).unwrap_or(created);
            let time = next_valid_delta_rev(previous, Some(event.created()));
            let index = revisions.len();

            let revision = match event {
                Event::Change(entry) => {
                    let author = entry.author.as_ref().and_then(|a| a.identity()).map(str::to_string);
                    let mut rev = SourceRevision::new(index, time, author);
                    for item in &entry.items {
                        apply_item(key, item, epic_field, &all_attachments, &mut rev);
                    }
                    rev
                }
                Event::Comment { author, body, .. } => {
                    let mut rev = SourceRevision::new(index, time, author);
                    rev.fields.insert(COMMENT_FIELD.to_string(), Value::String(body));
                    rev
                }
            };
            revisions.push(revision);
        }

        let rendered = snapshot
            .get("renderedFields")
            .and_then(Value::as_object)
            .map(|r| {
                r.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        debug!("Built {} revisions for '{}'", revisions.len(), key);

        Ok(Self {
            key: key.to_string(),
            id: snapshot
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            issue_type,
            revisions,
            rendered,
            fields,
            epic_link_field: settings.epic_link_field.clone(),
        })
    }

    /// Value of `field` as of revision `index`
    ///
    /// Walks revisions backward from `index` and returns the value from the
    /// first one that set the field. A cleared field yields `Value::Null`.
    pub fn get_field_value(&self, index: usize, field: &str) -> Option<&Value> {
        self.revisions
            .iter()
            .rev()
            .skip_while(|r| r.index > index)
            .find_map(|r| r.fields.get(field))
    }

    /// Keys of related issues selected by the export download options
    pub fn related_keys(&self, options: u32) -> Vec<String> {
        let mut keys = Vec::new();
        let key_of = |v: &Value| v.get("key").and_then(Value::as_str).map(str::to_string);

        if options & download_options::INCLUDE_PARENTS != 0
            && let Some(parent) = self.fields.get("parent").and_then(key_of)
        {
            keys.push(parent);
        }
        if options & download_options::INCLUDE_PARENT_EPICS != 0
            && let Some(epic) = self
                .epic_link_field
                .as_deref()
                .and_then(|f| self.fields.get(f))
                .and_then(Value::as_str)
        {
            keys.push(epic.to_string());
        }
        if options & download_options::INCLUDE_SUB_ITEMS != 0
            && let Some(subtasks) = self.fields.get("subtasks").and_then(Value::as_array)
        {
            keys.extend(subtasks.iter().filter_map(key_of));
        }
        if options & download_options::INCLUDE_LINKED_ITEMS != 0
            && let Some(links) = self.fields.get("issuelinks").and_then(Value::as_array)
        {
            for link in links {
                let other = link.get("outwardIssue").or_else(|| link.get("inwardIssue"));
                keys.extend(other.and_then(key_of));
            }
        }
        keys
    }
}

impl SourceItem {
    /// Keys of the issues belonging to this epic; empty for other issue types
    ///
    /// `epic_link_name` is the display name of the epic link field as used in
    /// queries.
    pub fn epic_children(
        &self,
        client: &dyn SourceConnector,
        epic_link_name: &str,
        batch_size: usize,
    ) -> Result<Vec<String>> {
        if !self.issue_type.eq_ignore_ascii_case(EPIC_LINK_TYPE) {
            return Ok(Vec::new());
        }
        let query = format!("\"{}\" = {} ORDER BY key ASC", epic_link_name, self.key);
        let batch = batch_size.max(1);
        let mut keys = Vec::new();
        loop {
            let page = client.search_keys(&query, keys.len(), batch)?;
            let last = page.len() < batch;
            keys.extend(page);
            if last {
                break;
            }
        }
        debug!("Epic '{}' has {} children", self.key, keys.len());
        Ok(keys)
    }
}

/// Collapse a structured source value into a scalar
///
/// Users become their identity, named objects their name, server sprint
/// strings their sprint name, and arrays a comma separated list.
pub fn normalize_field_value(value: &Value) -> Value {
    match value {
        Value::String(s) => match SERVER_SPRINT.captures(s) {
            Some(caps) => Value::String(caps[1].to_string()),
            None => value.clone(),
        },
        Value::Object(obj) => {
            if let Some(identity) = user_identity(value) {
                return Value::String(identity);
            }
            ["value", "name", "displayName", "key"]
                .iter()
                .find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
                .map(normalize_field_value)
                .unwrap_or_else(|| Value::String(value.to_string()))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(normalize_field_value)
                .filter_map(|v| match v {
                    Value::String(s) => Some(s),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect();
            if parts.is_empty() {
                Value::Null
            } else {
                Value::String(parts.join(", "))
            }
        }
        other => other.clone(),
    }
}

fn user_identity(value: &Value) -> Option<String> {
    let looks_like_user = value.get("accountId").is_some()
        || value.get("emailAddress").is_some()
        || value
            .get("self")
            .and_then(Value::as_str)
            .is_some_and(|s| s.contains("/user"));
    if !looks_like_user {
        return None;
    }
    let user: SourceUser = serde_json::from_value(value.clone()).ok()?;
    user.identity().map(str::to_string)
}

fn current_values(fields: &Map<String, Value>, epic_field: Option<&str>) -> BTreeMap<String, Value> {
    fields
        .iter()
        .filter(|(k, _)| !STRUCTURAL_FIELDS.contains(&k.as_str()) && Some(k.as_str()) != epic_field)
        .map(|(k, v)| (k.clone(), normalize_field_value(v)))
        .filter(|(_, v)| !v.is_null())
        .collect()
}

fn current_links(key: &str, fields: &Map<String, Value>, epic_field: Option<&str>) -> Vec<SourceLink> {
    let mut links = Vec::new();

    if let Some(issue_links) = fields.get("issuelinks").and_then(Value::as_array) {
        for link in issue_links {
            let link_type = link.get("type");
            let (other, phrase) = match (link.get("outwardIssue"), link.get("inwardIssue")) {
                (Some(out), _) => (out, link_type.and_then(|t| t.get("outward"))),
                (None, Some(inw)) => (inw, link_type.and_then(|t| t.get("inward"))),
                (None, None) => continue,
            };
            let Some(target_key) = other.get("key").and_then(Value::as_str) else {
                continue;
            };
            let phrase = phrase
                .or_else(|| link_type.and_then(|t| t.get("name")))
                .and_then(Value::as_str)
                .unwrap_or_default();
            links.push(SourceLink {
                source_key: key.to_string(),
                target_key: target_key.to_string(),
                link_type: phrase.to_string(),
            });
        }
    }

    if let Some(parent) = fields.get("parent").and_then(|p| p.get("key")).and_then(Value::as_str) {
        links.push(SourceLink {
            source_key: key.to_string(),
            target_key: parent.to_string(),
            link_type: PARENT_LINK_TYPE.to_string(),
        });
    }

    if let Some(epic) = epic_field.and_then(|f| fields.get(f)).and_then(Value::as_str) {
        links.push(SourceLink {
            source_key: key.to_string(),
            target_key: epic.to_string(),
            link_type: EPIC_LINK_TYPE.to_string(),
        });
    }

    links
}

fn current_attachments(fields: &Map<String, Value>) -> Vec<SourceAttachment> {
    fields
        .get("attachment")
        .and_then(Value::as_array)
        .map(|atts| {
            atts.iter()
                .filter_map(|a| {
                    Some(SourceAttachment {
                        id: scalar_string(a.get("id")?)?,
                        file_name: a.get("filename")?.as_str()?.to_string(),
                        url: a.get("content").and_then(Value::as_str).map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn comment_events<'a>(fields: &Map<String, Value>) -> Result<Vec<Event<'a>>> {
    let Some(list) = fields
        .get("comment")
        .and_then(|c| c.get("comments"))
        .and_then(Value::as_array)
    else {
        return Ok(Vec::new());
    };

    let mut events = Vec::new();
    for comment in list {
        let Some(body) = comment.get("body").and_then(Value::as_str) else {
            continue;
        };
        let Some(created) = comment.get("created").and_then(Value::as_str) else {
            continue;
        };
        events.push(Event::Comment {
            author: comment.get("author").and_then(user_identity),
            body: body.to_string(),
            created: parse_source_date(created)?,
        });
    }
    Ok(events)
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// What a changelog item changes
enum ItemKind<'a> {
    Attachment,
    Link,
    Membership(&'a str),
    Field,
}

fn classify<'a>(item: &ChangelogItem, epic_field: Option<&str>) -> ItemKind<'a> {
    match item.field.as_str() {
        "Attachment" => ItemKind::Attachment,
        "Link" => ItemKind::Link,
        "Epic Link" => ItemKind::Membership(EPIC_LINK_TYPE),
        "Parent" | "IssueParentAssociation" => ItemKind::Membership(PARENT_LINK_TYPE),
        _ if epic_field.is_some_and(|f| item.key() == f) => ItemKind::Membership(EPIC_LINK_TYPE),
        _ => ItemKind::Field,
    }
}

/// Link described by a changelog `Link` value and its display string
fn changelog_link(key: &str, target: &str, display: Option<&str>) -> SourceLink {
    let link_type = display
        .and_then(|d| LINK_PHRASE.captures(d))
        .map(|c| c[1].to_string())
        .unwrap_or_default();
    SourceLink {
        source_key: key.to_string(),
        target_key: target.to_string(),
        link_type,
    }
}

fn field_change(item: &ChangelogItem, old: bool) -> Value {
    let identity = IDENTITY_FIELDS.contains(&item.key());
    let value = match (old, identity) {
        (true, true) => item.from.as_ref(),
        (true, false) => item.from_string.as_ref(),
        (false, true) => item.to.as_ref(),
        (false, false) => item.to_string.as_ref(),
    };
    value.map_or(Value::Null, |v| Value::String(v.clone()))
}

fn undo_item(
    key: &str,
    item: &ChangelogItem,
    epic_field: Option<&str>,
    current: &mut BTreeMap<String, Value>,
    links: &mut Vec<SourceLink>,
    attachments: &mut Vec<SourceAttachment>,
) {
    match classify(item, epic_field) {
        ItemKind::Attachment => {
            if let Some(added) = &item.to {
                attachments.retain(|a| &a.id != added);
            }
            if let Some(removed) = &item.from {
                attachments.push(SourceAttachment {
                    id: removed.clone(),
                    file_name: item.from_string.clone().unwrap_or_default(),
                    url: None,
                });
            }
        }
        ItemKind::Link => {
            if let Some(added) = &item.to {
                let link = changelog_link(key, added, item.to_string.as_deref());
                if let Some(pos) = links.iter().position(|l| l.target_key == link.target_key) {
                    links.remove(pos);
                }
            }
            if let Some(removed) = &item.from {
                links.push(changelog_link(key, removed, item.from_string.as_deref()));
            }
        }
        ItemKind::Membership(link_type) => {
            if let Some(added) = &item.to_string {
                links.retain(|l| !(l.link_type == link_type && &l.target_key == added));
            }
            if let Some(removed) = &item.from_string {
                links.push(SourceLink {
                    source_key: key.to_string(),
                    target_key: removed.clone(),
                    link_type: link_type.to_string(),
                });
            }
        }
        ItemKind::Field => {
            current.insert(item.key().to_string(), field_change(item, true));
        }
    }
}

fn apply_item(
    key: &str,
    item: &ChangelogItem,
    epic_field: Option<&str>,
    all_attachments: &[SourceAttachment],
    rev: &mut SourceRevision,
) {
    match classify(item, epic_field) {
        ItemKind::Attachment => {
            if let Some(removed) = &item.from {
                rev.attachment_actions.push(RevisionAction {
                    change: RevisionChangeType::Removed,
                    value: SourceAttachment {
                        id: removed.clone(),
                        file_name: item.from_string.clone().unwrap_or_default(),
                        url: None,
                    },
                });
            }
            if let Some(added) = &item.to {
                match all_attachments.iter().find(|a| &a.id == added) {
                    Some(att) => rev.attachment_actions.push(RevisionAction {
                        change: RevisionChangeType::Added,
                        value: att.clone(),
                    }),
                    None => warn!(
                        "Attachment {} of '{}' no longer exists, skipping",
                        added, key
                    ),
                }
            }
        }
        ItemKind::Link => {
            if let Some(removed) = &item.from {
                rev.link_actions.push(RevisionAction {
                    change: RevisionChangeType::Removed,
                    value: changelog_link(key, removed, item.from_string.as_deref()),
                });
            }
            if let Some(added) = &item.to {
                rev.link_actions.push(RevisionAction {
                    change: RevisionChangeType::Added,
                    value: changelog_link(key, added, item.to_string.as_deref()),
                });
            }
        }
        ItemKind::Membership(link_type) => {
            for (change, target) in [
                (RevisionChangeType::Removed, &item.from_string),
                (RevisionChangeType::Added, &item.to_string),
            ] {
                if let Some(target) = target {
                    rev.link_actions.push(RevisionAction {
                        change,
                        value: SourceLink {
                            source_key: key.to_string(),
                            target_key: target.clone(),
                            link_type: link_type.to_string(),
                        },
                    });
                }
            }
        }
        ItemKind::Field => {
            rev.fields.insert(item.key().to_string(), field_change(item, false));
        }
    }
}
