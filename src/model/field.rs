// src/model/field.rs

//! Typed field values keyed by target reference name

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference names of target fields the engine treats specially
pub mod field_ref {
    pub const WORK_ITEM_TYPE: &str = "System.WorkItemType";
    pub const TITLE: &str = "System.Title";
    pub const DESCRIPTION: &str = "System.Description";
    pub const STATE: &str = "System.State";
    pub const REASON: &str = "System.Reason";
    pub const AREA_PATH: &str = "System.AreaPath";
    pub const ITERATION_PATH: &str = "System.IterationPath";
    pub const HISTORY: &str = "System.History";
    pub const TAGS: &str = "System.Tags";
    pub const ASSIGNED_TO: &str = "System.AssignedTo";
    pub const CREATED_BY: &str = "System.CreatedBy";
    pub const CREATED_DATE: &str = "System.CreatedDate";
    pub const CHANGED_BY: &str = "System.ChangedBy";
    pub const CHANGED_DATE: &str = "System.ChangedDate";
    pub const ACTIVATED_BY: &str = "Microsoft.VSTS.Common.ActivatedBy";
    pub const ACTIVATED_DATE: &str = "Microsoft.VSTS.Common.ActivatedDate";
    pub const CLOSED_BY: &str = "Microsoft.VSTS.Common.ClosedBy";
    pub const CLOSED_DATE: &str = "Microsoft.VSTS.Common.ClosedDate";
    pub const REPRO_STEPS: &str = "Microsoft.VSTS.TCM.ReproSteps";
    pub const PRIORITY: &str = "Microsoft.VSTS.Common.Priority";
}

/// A field value after mapping
///
/// Downstream code never sees untyped values: the mapper decides which variant a
/// source value becomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    String(String),
    Number(f64),
    Date(DateTime<Utc>),
    Identity(String),
    Empty,
}

impl FieldValue {
    /// Text of string and identity values
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Identity(s) => Some(s),
            _ => None,
        }
    }

    /// True for the explicit-empty value and for blank strings
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::String(s) | Self::Identity(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// JSON representation submitted to the target system
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) | Self::Identity(s) => serde_json::Value::String(s.clone()),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Date(d) => serde_json::Value::String(d.to_rfc3339()),
            Self::Empty => serde_json::Value::String(String::new()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) | Self::Identity(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Date(d) => write!(f, "{}", d.to_rfc3339()),
            Self::Empty => Ok(()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// One field change in a mapped revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WiField {
    pub reference_name: String,
    pub value: FieldValue,
}

impl WiField {
    pub fn new(reference_name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self {
            reference_name: reference_name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for WiField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]={}", self.reference_name, self.value)
    }
}

/// True if any field in `fields` has the given reference name
pub fn has_any_by_ref_name(fields: Option<&[WiField]>, reference_name: &str) -> bool {
    fields.is_some_and(|fields| fields.iter().any(|f| f.reference_name == reference_name))
}

/// Value of the first field with the given reference name (case-insensitive)
pub fn field_value<'a>(fields: &'a [WiField], reference_name: &str) -> Option<&'a FieldValue> {
    fields
        .iter()
        .find(|f| f.reference_name.eq_ignore_ascii_case(reference_name))
        .map(|f| &f.value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_display() {
        let field = WiField::new("referenceName", "objValue");
        assert_eq!(field.to_string(), "[referenceName]=objValue");
    }

    #[test]
    fn test_has_any_by_ref_name() {
        assert!(!has_any_by_ref_name(None, "name"));
        assert!(!has_any_by_ref_name(Some(&[]), "name"));

        let fields = vec![WiField::new("name", "x")];
        assert!(has_any_by_ref_name(Some(&fields), "name"));

        let fields = vec![WiField::new("anothername", "x")];
        assert!(!has_any_by_ref_name(Some(&fields), "name"));
    }

    #[test]
    fn test_value_serialization_is_tagged() {
        let json = serde_json::to_string(&FieldValue::Identity("jdoe".into())).unwrap();
        assert_eq!(json, r#"{"type":"identity","value":"jdoe"}"#);

        let empty: FieldValue = serde_json::from_str(r#"{"type":"empty"}"#).unwrap();
        assert_eq!(empty, FieldValue::Empty);
    }

    #[test]
    fn test_empty_detection() {
        assert!(FieldValue::Empty.is_empty());
        assert!(FieldValue::String("  ".into()).is_empty());
        assert!(!FieldValue::Number(0.0).is_empty());
    }
}
