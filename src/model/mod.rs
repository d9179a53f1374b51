// src/model/mod.rs

//! Target-agnostic migration records
//!
//! The export phase produces these records from the source system; the import
//! phase replays them into the target. They are the contract between the two
//! halves of a migration and are persisted as JSON in the workspace.

mod field;
mod item;
mod iteration;
mod provider;

pub use field::{FieldValue, WiField, field_ref, field_value, has_any_by_ref_name};
pub use item::{ReferenceChangeType, WiAttachment, WiItem, WiLink, WiRevision};
pub use iteration::WiIteration;
pub use provider::WiItemProvider;
