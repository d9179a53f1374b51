// src/replay/mod.rs

//! Revision replay against the target system
//!
//! The [`Agent`] takes one planned revision at a time through these stages:
//!
//! 1. resolve the target item (fetch by journaled id or create a blank one)
//! 2. pre-process the revision (see [`prepare`])
//! 3. collect attachment, field and link changes into one [`WorkItemPatch`],
//!    journaling each upload as soon as it succeeds
//! 4. rewrite attachment references in rich text
//! 5. save, then save the corrected text again when the revision uploaded new
//!    attachments
//! 6. journal the revision as processed
//!
//! A failed change within a revision makes it incomplete but the rest is still
//! saved and the revision is journaled. Only [`Error::Aborted`] stops the run.

mod ado;
mod classification;
mod memory;
pub mod prepare;
pub mod target;
mod text;

pub use ado::{AdoClient, AdoSettings, patch_document};
pub use classification::ClassificationCache;
pub use memory::InMemoryTarget;
pub use target::{
    ATTACHED_FILE_REL, ClassificationKind, ClassificationNode, NewClassificationNode,
    OperationStatus, Relation, TargetConnector, TargetProject, WorkItem, WorkItemPatch,
};
pub use text::{AttachmentUrl, correct_references, resolve_attachment_urls};

use crate::config::ConfigFile;
use crate::context::MigrationContext;
use crate::journal::Journal;
use crate::model::{
    FieldValue, ReferenceChangeType, WiField, WiItemProvider, WiRevision, field_ref,
    has_any_by_ref_name,
};
use crate::plan::ExecutionItem;
use crate::telemetry::Severity;
use crate::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use prepare::description_field;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Fields that are written even when the revision clears them
const CLEARABLE_FIELDS: &[&str] = &[
    field_ref::ACTIVATED_DATE,
    field_ref::ACTIVATED_BY,
    field_ref::CLOSED_DATE,
    field_ref::CLOSED_BY,
    field_ref::TAGS,
];

/// Replay settings for one target project
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub project: String,
    /// Prefix of every area path, `/`-separated
    pub base_area_path: String,
    /// Prefix of every iteration path, `/`-separated
    pub base_iteration_path: String,
    pub ignore_failed_links: bool,
    pub process_template: String,
    /// Attempts to fetch or create an item before the revision fails
    pub max_attempts: u32,
    /// Pause between those attempts
    pub retry_pause: Duration,
    /// Polling interval while a project is being created
    pub poll_interval: Duration,
    /// Give up waiting for project creation after this long
    pub poll_timeout: Duration,
}

impl AgentSettings {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            base_area_path: String::new(),
            base_iteration_path: String::new(),
            ignore_failed_links: false,
            process_template: "Scrum".to_string(),
            max_attempts: 5,
            retry_pause: Duration::from_secs(1),
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &ConfigFile) -> Self {
        Self {
            base_area_path: config.base_area_path.replace('\\', "/"),
            base_iteration_path: config.base_iteration_path.replace('\\', "/"),
            ignore_failed_links: config.ignore_failed_links,
            process_template: config.process_template.clone(),
            ..Self::new(config.target_project.clone())
        }
    }
}

/// Result of replaying one revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Every change was saved
    Complete,
    /// Saved and journaled, but some changes were dropped
    Incomplete,
    /// Nothing was journaled
    Failed,
}

/// Replays planned revisions into a target
pub struct Agent<'t> {
    target: &'t dyn TargetConnector,
    settings: AgentSettings,
    classifications: ClassificationCache,
}

impl<'t> Agent<'t> {
    pub fn new(target: &'t dyn TargetConnector, settings: AgentSettings) -> Self {
        Self {
            target,
            settings,
            classifications: ClassificationCache::new(),
        }
    }

    /// Connect to the project, creating it if confirmed, and warm the path caches
    pub fn initialize(
        target: &'t dyn TargetConnector,
        settings: AgentSettings,
        confirm: &dyn Fn(&str) -> bool,
    ) -> Result<Self> {
        let agent = Self::new(target, settings);

        if agent.get_or_create_project(confirm)?.is_none() {
            return Err(Error::InitError(format!(
                "Could not establish connection to target project '{}'",
                agent.settings.project
            )));
        }

        for kind in [ClassificationKind::Iteration, ClassificationKind::Area] {
            let count = agent
                .classifications
                .warm_up(target, kind)
                .map_err(|e| Error::InitError(format!("Could not build {kind} cache: {e}")))?;
            debug!("{} {} nodes cached", count, kind);
        }
        Ok(agent)
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn classifications(&self) -> &ClassificationCache {
        &self.classifications
    }

    /// Fetch the project, or create it after confirmation
    pub fn get_or_create_project(&self, confirm: &dyn Fn(&str) -> bool) -> Result<Option<TargetProject>> {
        let name = &self.settings.project;
        info!("Retrieving project info for '{}'...", name);
        match self.target.get_project(name) {
            Ok(Some(project)) => return Ok(Some(project)),
            Ok(None) => {}
            Err(e) if e.is_abort() => return Err(e),
            Err(e) => error!("Failed to get target project '{}': {}", name, e),
        }

        warn!("Project '{}' does not exist.", name);
        if !confirm(&format!("Would you like to create project '{name}'? (Y/N)")) {
            return Ok(None);
        }

        info!("Creating project '{}'.", name);
        let template = &self.settings.process_template;
        let operation = match self.target.queue_create_project(
            name,
            &format!("{template} project for Jira migration"),
            template,
        ) {
            Ok(operation) => operation,
            Err(e) if e.is_abort() => return Err(e),
            Err(e) => {
                Severity::Critical.report(&format!("Exception during create project: {e}"))?;
                return Ok(None);
            }
        };

        match self.wait_for_operation(&operation) {
            Ok(OperationStatus::Failed) => {
                error!("Project creation operation failed.");
                return Ok(None);
            }
            Ok(_) => {}
            Err(Error::TimeoutError(msg)) => error!("Project creation: {}", msg),
            Err(e) => return Err(e),
        }
        let project = self.target.get_project(name)?;
        if let Some(project) = &project {
            info!("Project created (ID: {})", project.id);
        }
        Ok(project)
    }

    /// Poll an asynchronous operation until it finishes or the timeout passes
    fn wait_for_operation(&self, operation_id: &str) -> Result<OperationStatus> {
        let started = Instant::now();
        let mut checks = 0;
        loop {
            info!("Checking status ({})...", checks);
            checks += 1;
            let status = self.target.get_operation(operation_id)?;
            if status != OperationStatus::InProgress {
                return Ok(status);
            }
            if started.elapsed() >= self.settings.poll_timeout {
                return Err(Error::TimeoutError(format!(
                    "operation {} did not complete in {} seconds",
                    operation_id,
                    self.settings.poll_timeout.as_secs()
                )));
            }
            info!("Pausing {} seconds...", self.settings.poll_interval.as_secs());
            std::thread::sleep(self.settings.poll_interval);
        }
    }

    /// Replay one planned revision
    pub fn import(&self, ctx: &mut MigrationContext, exec: &ExecutionItem) -> Result<ImportOutcome> {
        match self.resolve_work_item(ctx, exec)? {
            Some(wi) => self.import_revision(ctx, &exec.revision, wi),
            None => Ok(ImportOutcome::Failed),
        }
    }

    /// Fetch the item by its journaled id, or create it
    ///
    /// A newly created item is journaled right away so later revisions and
    /// links find it even if this revision fails.
    pub fn resolve_work_item(&self, ctx: &mut MigrationContext, exec: &ExecutionItem) -> Result<Option<WorkItem>> {
        let attempts = self.settings.max_attempts.max(1);
        for attempt in 1..=attempts {
            if attempt > 1 {
                std::thread::sleep(self.settings.retry_pause);
            }
            let result = match exec.wi_id {
                Some(id) => self.target.get_work_item(id),
                None => self.target.create_work_item(&exec.wi_type),
            };
            match result {
                Ok(Some(wi)) => {
                    if exec.wi_id.is_none() {
                        let Some(id) = wi.id else {
                            Severity::Critical.report(&format!(
                                "Work item created for '{}' has no id: {}",
                                exec.origin_id, wi.url
                            ))?;
                            return Ok(None);
                        };
                        ctx.journal.mark_item_migrated(&exec.origin_id, id)?;
                    }
                    return Ok(Some(wi));
                }
                Ok(None) => debug!("No work item returned for {} (attempt {})", exec, attempt),
                Err(e) if e.is_abort() => return Err(e),
                Err(e) => warn!("Failed to resolve work item for {} (attempt {}): {}", exec, attempt, e),
            }
        }
        error!("Could not resolve a work item for {} after {} attempts", exec, attempts);
        Ok(None)
    }

    /// Apply `rev` to `wi` and journal it
    ///
    /// Missing attachment content and other failures skip the revision; only
    /// the abort signal is returned as an error.
    pub fn import_revision(&self, ctx: &mut MigrationContext, rev: &WiRevision, mut wi: WorkItem) -> Result<ImportOutcome> {
        match self.apply_revision(ctx, rev, &mut wi) {
            Ok(outcome) => {
                debug!("Imported revision {}.", rev);
                Ok(outcome)
            }
            Err(e) if e.is_abort() => Err(e),
            Err(e) if e.is_file_not_found() => {
                error!("{}", e);
                error!("Failed to import revision '{}' of '{}'.", rev.index, rev.parent_origin_id);
                Ok(ImportOutcome::Failed)
            }
            Err(e) => {
                error!("Failed to import revision {} into {}: {}", rev, wi, e);
                Ok(ImportOutcome::Failed)
            }
        }
    }

    fn apply_revision(&self, ctx: &mut MigrationContext, rev: &WiRevision, wi: &mut WorkItem) -> Result<ImportOutcome> {
        let mut rev = rev.clone();
        prepare::ensure_classification_fields(&mut rev);
        prepare::ensure_date_fields(&mut rev);
        prepare::ensure_author_fields(&mut rev);
        prepare::ensure_assignee_field(&mut rev, wi);
        prepare::ensure_fields_on_state_change(&mut rev, wi);

        let mut patch = WorkItemPatch::default();
        prepare::ensure_work_item_fields_initialized(&rev, wi, &mut patch);

        let mut incomplete = false;
        if !rev.attachments.is_empty() && !self.apply_attachments(&rev, wi, &mut ctx.journal, &mut patch)? {
            incomplete = true;
        }
        if !rev.fields.is_empty() && !self.update_fields(&rev.fields, &ctx.provider, &mut patch)? {
            incomplete = true;
        }
        if !has_any_by_ref_name(Some(&rev.fields), field_ref::HISTORY) {
            patch.remove_field(field_ref::HISTORY);
        }
        if !rev.links.is_empty() && !self.apply_links(&rev, wi, &ctx.journal, &mut patch) {
            incomplete = true;
        }
        if incomplete {
            warn!("{} - not all changes were saved.", rev);
        }

        let correct_now = !rev.has_added_attachments() && rev.attachment_references;
        let has_history = patch
            .fields
            .get(field_ref::HISTORY)
            .is_some_and(|h| !h.is_empty());
        if correct_now || has_history {
            let urls = self.attachment_urls(ctx, &rev)?;
            if correct_now {
                debug!("Correcting description on {}.", rev);
                correct_description(wi, &mut patch, &urls);
            }
            if has_history {
                debug!("Correcting comments on {}.", rev);
                correct_comment(&mut patch, &urls);
            }
        }

        self.save(wi, &mut patch, rev.time)?;

        if rev.has_added_attachments() && rev.attachment_references {
            debug!("Correcting description on separate revision on {}.", rev);
            if let Err(e) = self.correct_after_upload(ctx, &rev, wi) {
                if e.is_abort() {
                    return Err(e);
                }
                error!("Failed to correct description for {}, rev {}: {}", wi, rev, e);
            }
        }

        let id = wi
            .id
            .ok_or_else(|| Error::invalid_argument(format!("{wi} has no id")))?;
        ctx.journal.mark_rev_processed(&rev.parent_origin_id, id, rev.index)?;

        Ok(if incomplete {
            ImportOutcome::Incomplete
        } else {
            ImportOutcome::Complete
        })
    }

    /// Second save rewriting references to attachments uploaded by `rev`
    fn correct_after_upload(&self, ctx: &MigrationContext, rev: &WiRevision, wi: &mut WorkItem) -> Result<()> {
        let urls = self.attachment_urls(ctx, rev)?;
        let mut patch = WorkItemPatch::default();
        if correct_description(wi, &mut patch, &urls) {
            // Dated after the base save so it becomes its own target revision
            self.save(wi, &mut patch, rev.time + ChronoDuration::milliseconds(1))?;
        }
        Ok(())
    }

    fn attachment_urls(&self, ctx: &MigrationContext, rev: &WiRevision) -> Result<Vec<AttachmentUrl>> {
        let item = ctx.get_item(&rev.parent_origin_id)?;
        Ok(resolve_attachment_urls(&item, rev.index, &ctx.journal))
    }

    /// Submit `patch`, stamping the change date, and refresh `wi`
    fn save(&self, wi: &mut WorkItem, patch: &mut WorkItemPatch, time: DateTime<Utc>) -> Result<()> {
        let id = wi
            .id
            .ok_or_else(|| Error::invalid_argument(format!("{wi} has no id")))?;
        patch.set_field(field_ref::CHANGED_DATE, FieldValue::Date(time));
        *wi = self.target.update_work_item(id, patch)?;
        Ok(())
    }

    /// Compose a configured base path with a revision's relative path
    fn compose_path(base: &str, value: &FieldValue) -> String {
        let relative = value.as_str().map(|s| s.trim().replace('\\', "/")).unwrap_or_default();
        match (base.is_empty(), relative.is_empty()) {
            (_, true) => base.to_string(),
            (true, false) => relative,
            (false, false) => format!("{base}/{relative}"),
        }
    }

    /// Write a classification path field, materializing the path first
    fn update_classification(
        &self,
        provider: &WiItemProvider,
        kind: ClassificationKind,
        reference_name: &str,
        value: &FieldValue,
        patch: &mut WorkItemPatch,
    ) -> Result<bool> {
        let base = match kind {
            ClassificationKind::Area => &self.settings.base_area_path,
            ClassificationKind::Iteration => &self.settings.base_iteration_path,
        };
        let path = Self::compose_path(base, value);
        let project = &self.settings.project;

        let target_value = if path.is_empty() {
            project.clone()
        } else {
            if self.classifications.ensure(self.target, provider, kind, &path)?.is_none() {
                return Ok(false);
            }
            format!("{}\\{}", project, path.replace('/', "\\"))
        };
        debug!("Mapped {} '{}'.", reference_name, target_value);
        patch.set_field(reference_name, FieldValue::String(target_value));
        Ok(true)
    }

    /// Copy revision fields into the patch
    fn update_fields(&self, fields: &[WiField], provider: &WiItemProvider, patch: &mut WorkItemPatch) -> Result<bool> {
        let mut success = true;
        for field in fields {
            let name = field.reference_name.as_str();
            let kind = if name.eq_ignore_ascii_case(field_ref::ITERATION_PATH) {
                Some(ClassificationKind::Iteration)
            } else if name.eq_ignore_ascii_case(field_ref::AREA_PATH) {
                Some(ClassificationKind::Area)
            } else {
                None
            };

            if let Some(kind) = kind {
                match self.update_classification(provider, kind, name, &field.value, patch) {
                    Ok(true) => {}
                    Ok(false) => success = false,
                    Err(e) if e.is_abort() => return Err(e),
                    Err(e) => {
                        error!("Failed to update {}: {}", name, e);
                        success = false;
                    }
                }
                continue;
            }

            let is_empty = matches!(field.value, FieldValue::Empty);
            if CLEARABLE_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(name)) && is_empty {
                patch.set_field(name, FieldValue::Empty);
            } else if name.eq_ignore_ascii_case(field_ref::CHANGED_DATE)
                || name.eq_ignore_ascii_case(field_ref::WORK_ITEM_TYPE)
            {
                continue;
            } else if !is_empty {
                patch.set_field(name, field.value.clone());
            }
        }
        Ok(success)
    }

    /// Upload and attach added files, detach removed ones
    ///
    /// Uploads are journaled before the item is saved, so a retried revision
    /// links the same attachment instead of uploading it again.
    fn apply_attachments(
        &self,
        rev: &WiRevision,
        wi: &WorkItem,
        journal: &mut Journal,
        patch: &mut WorkItemPatch,
    ) -> Result<bool> {
        let mut success = true;
        for att in &rev.attachments {
            match att.change {
                ReferenceChangeType::Added => {
                    let journaled = journal.is_attachment_migrated(&att.att_origin_id).map(str::to_string);
                    let url = match journaled {
                        Some(url) => {
                            debug!("Attachment {} already uploaded, reusing {}", att, url);
                            url
                        }
                        None => match self.target.upload_attachment(Path::new(&att.file_path)) {
                            Ok(url) => {
                                journal.mark_attachment_migrated(&att.att_origin_id, &url)?;
                                url
                            }
                            Err(e) if e.is_abort() || e.is_file_not_found() => return Err(e),
                            Err(e) => {
                                error!("Failed to upload attachment {} for {}: {}", att, rev, e);
                                success = false;
                                continue;
                            }
                        },
                    };

                    let relation = Relation::new(ATTACHED_FILE_REL, url)
                        .with_attribute(
                            target::COMMENT_ATTRIBUTE,
                            format!("{}|{}", att.comment.as_deref().unwrap_or(""), att.att_origin_id),
                        )
                        .with_attribute(target::NAME_ATTRIBUTE, att.reference_name());
                    if patch.effective_relations(wi).any(|r| r.same_target(&relation)) {
                        debug!("Attachment {} already linked to {}", att, wi);
                    } else {
                        patch.added_relations.push(relation);
                    }
                }
                ReferenceChangeType::Removed => {
                    let journaled = journal.is_attachment_migrated(&att.att_origin_id);
                    let origin_suffix = format!("|{}", att.att_origin_id);
                    let found = wi.relations.iter().enumerate().find(|(i, r)| {
                        r.is_attachment()
                            && !patch.removed_relations.contains(i)
                            && (journaled.is_some_and(|url| url == r.url)
                                || r.attribute(target::COMMENT_ATTRIBUTE)
                                    .is_some_and(|c| c.ends_with(&origin_suffix))
                                || r.attribute(target::NAME_ATTRIBUTE) == Some(att.reference_name()))
                    });
                    match found {
                        Some((index, _)) => patch.remove_relation(index),
                        None => {
                            warn!("Attachment {} not found on {}, cannot remove it", att, wi);
                            success = false;
                        }
                    }
                }
            }
        }
        Ok(success)
    }

    /// Add and remove links whose targets have been created
    fn apply_links(&self, rev: &WiRevision, wi: &WorkItem, journal: &Journal, patch: &mut WorkItemPatch) -> bool {
        let mut success = true;
        for link in &rev.links {
            let Some(target_id) = journal.get_migrated_id(&link.target_origin_id) else {
                let severity = if self.settings.ignore_failed_links {
                    Severity::Warning
                } else {
                    Severity::Error
                };
                // Warning and Error never abort
                let _ = severity.report(&format!(
                    "'{}' - target work item for '{}' is not yet created in the target.",
                    link, link.target_origin_id
                ));
                success = false;
                continue;
            };

            let relation = Relation::new(&link.wi_type, self.target.work_item_url(target_id));
            let applied = match link.change {
                ReferenceChangeType::Added => add_link(wi, patch, relation),
                ReferenceChangeType::Removed => remove_link(wi, patch, &relation),
            };
            if !applied {
                warn!("Could not apply link {} on {}", link, wi);
                success = false;
            }
        }

        let describe = |change: ReferenceChangeType| {
            rev.links
                .iter()
                .filter(|l| l.change == change)
                .map(|l| l.to_string())
                .collect::<Vec<_>>()
                .join(";")
        };
        let removed = describe(ReferenceChangeType::Removed);
        let added = describe(ReferenceChangeType::Added);
        if !removed.is_empty() {
            patch.set_field(field_ref::HISTORY, FieldValue::String(format!("Removed link(s): {removed}")));
        } else if !added.is_empty() {
            patch.set_field(field_ref::HISTORY, FieldValue::String(format!("Added link(s): {added}")));
        }
        success
    }
}

/// Queue `relation` unless the item already has it
fn add_link(wi: &WorkItem, patch: &mut WorkItemPatch, relation: Relation) -> bool {
    if patch.effective_relations(wi).any(|r| r.same_target(&relation)) {
        debug!("Link {} -> {} already exists on {}", relation.rel, relation.url, wi);
        return true;
    }
    patch.added_relations.push(relation);
    true
}

/// Queue removal of `relation`; false if the item does not have it
fn remove_link(wi: &WorkItem, patch: &mut WorkItemPatch, relation: &Relation) -> bool {
    if let Some(pos) = patch.added_relations.iter().position(|r| r.same_target(relation)) {
        patch.added_relations.remove(pos);
        return true;
    }
    let found = wi
        .relations
        .iter()
        .enumerate()
        .find(|(i, r)| r.same_target(relation) && !patch.removed_relations.contains(i));
    match found {
        Some((index, _)) => {
            patch.remove_relation(index);
            true
        }
        None => false,
    }
}

/// Rewrite attachment references in the description field
fn correct_description(wi: &WorkItem, patch: &mut WorkItemPatch, urls: &[AttachmentUrl]) -> bool {
    let field = description_field(wi.field_text(field_ref::WORK_ITEM_TYPE));
    let Some(text) = patch
        .effective_field(wi, field)
        .and_then(FieldValue::as_str)
        .map(str::to_string)
    else {
        return false;
    };
    match correct_references(&text, urls) {
        Some(corrected) => {
            patch.set_field(field, FieldValue::String(corrected));
            true
        }
        None => false,
    }
}

/// Rewrite attachment references in the pending comment
fn correct_comment(patch: &mut WorkItemPatch, urls: &[AttachmentUrl]) -> bool {
    let Some(text) = patch
        .fields
        .get(field_ref::HISTORY)
        .and_then(FieldValue::as_str)
        .map(str::to_string)
    else {
        return false;
    };
    match correct_references(&text, urls) {
        Some(corrected) => {
            patch.set_field(field_ref::HISTORY, FieldValue::String(corrected));
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{WiAttachment, WiItem, WiLink};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn settings() -> AgentSettings {
        AgentSettings {
            retry_pause: Duration::ZERO,
            poll_interval: Duration::ZERO,
            poll_timeout: Duration::ZERO,
            ..AgentSettings::new("Proj")
        }
    }

    fn context(temp: &TempDir) -> MigrationContext {
        MigrationContext::open_workspace(
            "wi-import",
            temp.path(),
            temp.path().join("Attachments"),
            temp.path().join("Sprints"),
            false,
        )
        .unwrap()
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 5, 1, 10, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn exec(item: &WiItem, index: usize, journal: &Journal) -> ExecutionItem {
        let mut revision = item.revisions[index].clone();
        revision.parent_origin_id = item.origin_id.clone();
        ExecutionItem {
            origin_id: item.origin_id.clone(),
            revision,
            wi_id: journal.get_migrated_id(&item.origin_id),
            wi_type: item.wi_type.clone(),
        }
    }

    #[test]
    fn test_compose_path() {
        let v = FieldValue::from("Sprint 1");
        assert_eq!(Agent::compose_path("", &v), "Sprint 1");
        assert_eq!(Agent::compose_path("Base", &v), "Base/Sprint 1");
        assert_eq!(Agent::compose_path("Base", &FieldValue::Empty), "Base");
        assert_eq!(Agent::compose_path("", &FieldValue::from("A\\B")), "A/B");
    }

    #[test]
    fn test_first_revision_creates_and_journals() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let target = InMemoryTarget::new("Proj");
        let agent = Agent::new(&target, AgentSettings {
            base_iteration_path: "Migrated".into(),
            ..settings()
        });

        let mut item = WiItem::new("PRJ-1", "Task");
        let mut rev = WiRevision::new(0, t(0), "ann");
        rev.fields.push(WiField::new(field_ref::TITLE, "First"));
        rev.fields.push(WiField::new(field_ref::ITERATION_PATH, "Sprint 1"));
        item.revisions.push(rev);
        ctx.provider.save(&item).unwrap();

        let planned = exec(&item, 0, &ctx.journal);
        let outcome = agent.import(&mut ctx, &planned).unwrap();
        assert_eq!(outcome, ImportOutcome::Complete);

        let id = ctx.journal.get_migrated_id("PRJ-1").unwrap();
        assert!(ctx.journal.is_item_migrated("PRJ-1", 0));
        let wi = target.item(id).unwrap();
        assert_eq!(wi.field_text(field_ref::TITLE), "First");
        assert_eq!(wi.field_text(field_ref::ITERATION_PATH), "Proj\\Migrated\\Sprint 1");
        assert_eq!(wi.field_text(field_ref::AREA_PATH), "Proj");
        assert_eq!(wi.field(field_ref::DESCRIPTION), Some(&FieldValue::Empty));
        assert_eq!(wi.field(field_ref::CHANGED_DATE), Some(&FieldValue::Date(t(0))));
        assert_eq!(wi.field(field_ref::CREATED_BY), Some(&FieldValue::Identity("ann".into())));
        assert!(target.has_classification(ClassificationKind::Iteration, "Migrated/Sprint 1"));
    }

    #[test]
    fn test_cleared_fields() {
        let temp = TempDir::new().unwrap();
        let target = InMemoryTarget::new("Proj");
        let agent = Agent::new(&target, settings());
        let provider = WiItemProvider::new(temp.path(), temp.path().join("Sprints"));

        let fields = vec![
            WiField::new(field_ref::CLOSED_DATE, FieldValue::Empty),
            WiField::new(field_ref::PRIORITY, FieldValue::Empty),
            WiField::new(field_ref::CHANGED_DATE, FieldValue::Date(t(5))),
            WiField::new(field_ref::STATE, "Active"),
        ];
        let mut patch = WorkItemPatch::default();
        assert!(agent.update_fields(&fields, &provider, &mut patch).unwrap());

        assert_eq!(patch.fields.get(field_ref::CLOSED_DATE), Some(&FieldValue::Empty));
        assert!(!patch.fields.contains_key(field_ref::PRIORITY));
        assert!(!patch.fields.contains_key(field_ref::CHANGED_DATE));
        assert_eq!(patch.fields.get(field_ref::STATE), Some(&FieldValue::from("Active")));
    }

    #[test]
    fn test_link_to_uncreated_item_fails_but_fields_commit() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let target = InMemoryTarget::new("Proj");
        let agent = Agent::new(&target, settings());

        let mut item = WiItem::new("PRJ-1", "Task");
        let mut rev = WiRevision::new(0, t(0), "ann");
        rev.fields.push(WiField::new(field_ref::TITLE, "A"));
        rev.links.push(WiLink {
            change: ReferenceChangeType::Added,
            source_origin_id: "PRJ-1".into(),
            target_origin_id: "PRJ-404".into(),
            wi_type: "System.LinkTypes.Related".into(),
        });
        item.revisions.push(rev);
        ctx.provider.save(&item).unwrap();

        let planned = exec(&item, 0, &ctx.journal);
        let outcome = agent.import(&mut ctx, &planned).unwrap();
        assert_eq!(outcome, ImportOutcome::Incomplete);

        let wi = target.item(ctx.journal.get_migrated_id("PRJ-1").unwrap()).unwrap();
        assert_eq!(wi.field_text(field_ref::TITLE), "A");
        assert!(wi.relations.is_empty());
        assert!(ctx.journal.is_item_migrated("PRJ-1", 0));
    }

    #[test]
    fn test_remove_missing_link_returns_false() {
        let wi = WorkItem {
            id: Some(1),
            ..Default::default()
        };
        let mut patch = WorkItemPatch::default();
        assert!(!remove_link(&wi, &mut patch, &Relation::new("r", "u")));
        assert!(patch.is_empty());
    }

    #[test]
    fn test_duplicate_link_is_not_added_twice() {
        let wi = WorkItem {
            id: Some(1),
            relations: vec![Relation::new("r", "https://x/2")],
            ..Default::default()
        };
        let mut patch = WorkItemPatch::default();
        assert!(add_link(&wi, &mut patch, Relation::new("r", "https://x/2")));
        assert!(patch.added_relations.is_empty());
    }

    #[test]
    fn test_attachment_added_then_removed() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let target = InMemoryTarget::new("Proj");
        let agent = Agent::new(&target, settings());

        let file = ctx.attachments_dir().join("100").join("a.png");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"png").unwrap();
        let att = |change| WiAttachment {
            change,
            att_origin_id: "100".into(),
            file_path: file.display().to_string(),
            file_name: "a.png".into(),
            comment: Some("Imported from PRJ-1".into()),
        };

        let mut item = WiItem::new("PRJ-1", "Task");
        let mut rev0 = WiRevision::new(0, t(0), "ann");
        rev0.fields.push(WiField::new(field_ref::TITLE, "A"));
        rev0.attachments.push(att(ReferenceChangeType::Added));
        let mut rev1 = WiRevision::new(1, t(10), "ann");
        rev1.attachments.push(att(ReferenceChangeType::Removed));
        item.revisions = vec![rev0, rev1];
        ctx.provider.save(&item).unwrap();

        let planned = exec(&item, 0, &ctx.journal);

        agent.import(&mut ctx, &planned).unwrap();
        let id = ctx.journal.get_migrated_id("PRJ-1").unwrap();
        let wi = target.item(id).unwrap();
        assert_eq!(wi.relations.len(), 1);
        assert_eq!(wi.relations[0].rel, ATTACHED_FILE_REL);
        assert_eq!(
            wi.relations[0].attribute(target::COMMENT_ATTRIBUTE),
            Some("Imported from PRJ-1|100")
        );
        assert_eq!(ctx.journal.is_attachment_migrated("100"), Some(wi.relations[0].url.as_str()));

        let planned = exec(&item, 1, &ctx.journal);
        let outcome = agent.import(&mut ctx, &planned).unwrap();
        assert_eq!(outcome, ImportOutcome::Complete);
        assert!(target.item(id).unwrap().relations.is_empty());
        assert_eq!(target.uploads().len(), 1);
    }

    #[test]
    fn test_missing_attachment_content_skips_revision() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let target = InMemoryTarget::new("Proj");
        let agent = Agent::new(&target, settings());

        let mut item = WiItem::new("PRJ-1", "Task");
        let mut rev = WiRevision::new(0, t(0), "ann");
        rev.attachments.push(WiAttachment {
            change: ReferenceChangeType::Added,
            att_origin_id: "7".into(),
            file_path: temp.path().join("missing.bin").display().to_string(),
            file_name: "missing.bin".into(),
            comment: None,
        });
        item.revisions.push(rev);

        let planned = exec(&item, 0, &ctx.journal);
        let outcome = agent.import(&mut ctx, &planned).unwrap();
        assert_eq!(outcome, ImportOutcome::Failed);
        assert!(!ctx.journal.is_item_migrated("PRJ-1", 0));
        // The item itself was created and journaled
        assert!(ctx.journal.get_migrated_id("PRJ-1").is_some());
    }

    #[test]
    fn test_create_retries_then_fails_revision() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let target = InMemoryTarget::new("Proj");
        let agent = Agent::new(&target, AgentSettings {
            max_attempts: 2,
            ..settings()
        });

        let mut item = WiItem::new("PRJ-1", "Task");
        item.revisions.push(WiRevision::new(0, t(0), "ann"));

        target.fail_next_creates(2);
        let planned = exec(&item, 0, &ctx.journal);
        assert_eq!(agent.import(&mut ctx, &planned).unwrap(), ImportOutcome::Failed);
        assert_eq!(target.item_count(), 0);

        target.fail_next_creates(1);
        assert_ne!(agent.import(&mut ctx, &planned).unwrap(), ImportOutcome::Failed);
    }

    #[test]
    fn test_initialize_creates_confirmed_project() {
        let target = InMemoryTarget::new("Other");
        assert!(Agent::initialize(&target, settings(), &|_: &str| false).is_err());

        let agent = Agent::initialize(&target, settings(), &|_: &str| true).unwrap();
        assert_eq!(agent.settings().project, "Proj");
        assert!(target.get_project("Proj").unwrap().is_some());
    }
}
