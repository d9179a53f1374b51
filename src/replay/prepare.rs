// src/replay/prepare.rs

//! Revision pre-processing before fields are applied
//!
//! The target system is written with workflow rules bypassed, so fields it
//! would normally maintain on its own (creation and change stamps, state side
//! fields, the current assignee) are added to the revision here.

use super::target::{WorkItem, WorkItemPatch};
use crate::model::{FieldValue, WiField, WiRevision, field_ref, field_value};

/// States that reset activation and closure metadata
const INITIAL_STATES: &[&str] = &["New", "To Do", "Proposed", "Open"];

/// States that stamp closure metadata
const CLOSED_STATES: &[&str] = &["Done", "Closed", "Removed", "Resolved"];

/// Rich-text field that holds the item description for `wi_type`
pub fn description_field(wi_type: &str) -> &'static str {
    if wi_type.eq_ignore_ascii_case("Bug") {
        field_ref::REPRO_STEPS
    } else {
        field_ref::DESCRIPTION
    }
}

fn has_field(rev: &WiRevision, reference_name: &str) -> bool {
    field_value(&rev.fields, reference_name).is_some()
}

fn push_missing(rev: &mut WiRevision, reference_name: &str, value: FieldValue) {
    if !has_field(rev, reference_name) {
        rev.fields.push(WiField::new(reference_name, value));
    }
}

fn is_one_of(state: &str, states: &[&str]) -> bool {
    states.iter().any(|s| s.eq_ignore_ascii_case(state))
}

/// Area and iteration default to the project root on the first revision
pub fn ensure_classification_fields(rev: &mut WiRevision) {
    if rev.index != 0 {
        return;
    }
    push_missing(rev, field_ref::AREA_PATH, FieldValue::Empty);
    push_missing(rev, field_ref::ITERATION_PATH, FieldValue::Empty);
}

/// Creation date on the first revision
///
/// The change date is stamped on every save instead, see [`super::Agent`].
pub fn ensure_date_fields(rev: &mut WiRevision) {
    if rev.index == 0 {
        push_missing(rev, field_ref::CREATED_DATE, FieldValue::Date(rev.time));
    }
}

/// Creator on the first revision, changer on every revision
pub fn ensure_author_fields(rev: &mut WiRevision) {
    let author = FieldValue::Identity(rev.author.clone());
    if rev.index == 0 {
        push_missing(rev, field_ref::CREATED_BY, author.clone());
    }
    push_missing(rev, field_ref::CHANGED_BY, author);
}

/// Keep the current assignee when the revision does not change it
pub fn ensure_assignee_field(rev: &mut WiRevision, wi: &WorkItem) {
    if has_field(rev, field_ref::ASSIGNED_TO) {
        return;
    }
    if let Some(assignee) = wi.field(field_ref::ASSIGNED_TO).filter(|v| !v.is_empty()) {
        rev.fields.push(WiField::new(field_ref::ASSIGNED_TO, assignee.clone()));
    }
}

/// Side fields of a state transition
///
/// Moving back to an initial state clears activation and closure data; moving
/// into a closed state stamps the closure with the revision's time and author.
pub fn ensure_fields_on_state_change(rev: &mut WiRevision, wi: &WorkItem) {
    if rev.index == 0 {
        return;
    }
    let Some(new_state) = field_value(&rev.fields, field_ref::STATE)
        .and_then(FieldValue::as_str)
        .map(str::to_string)
    else {
        return;
    };
    let old_state = wi.field_text(field_ref::STATE).to_string();
    if old_state.eq_ignore_ascii_case(&new_state) {
        return;
    }

    if is_one_of(&new_state, INITIAL_STATES) {
        for name in [
            field_ref::ACTIVATED_DATE,
            field_ref::ACTIVATED_BY,
            field_ref::CLOSED_DATE,
            field_ref::CLOSED_BY,
        ] {
            push_missing(rev, name, FieldValue::Empty);
        }
    } else if is_one_of(&new_state, CLOSED_STATES) && !is_one_of(&old_state, CLOSED_STATES) {
        push_missing(rev, field_ref::CLOSED_DATE, FieldValue::Date(rev.time));
        push_missing(rev, field_ref::CLOSED_BY, FieldValue::Identity(rev.author.clone()));
    }
}

/// Title and an empty description on a freshly created item
pub fn ensure_work_item_fields_initialized(rev: &WiRevision, wi: &WorkItem, patch: &mut WorkItemPatch) {
    if rev.index != 0 {
        return;
    }
    if let Some(title) = field_value(&rev.fields, field_ref::TITLE) {
        patch.set_field(field_ref::TITLE, title.clone());
    }
    let description = description_field(wi.field_text(field_ref::WORK_ITEM_TYPE));
    if wi.field(description).is_none() && !has_field(rev, description) {
        patch.set_field(description, FieldValue::Empty);
    }
}
