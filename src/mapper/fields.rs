// src/mapper/fields.rs

//! Value conversions applied by field rules
//!
//! Every conversion takes a loosely-typed source value and yields a typed
//! [`FieldValue`]. A JSON null is an explicit clear and becomes
//! [`FieldValue::Empty`]; `None` means the value could not be converted and the
//! field is left out of the revision.

use crate::config::ValueMapping;
use crate::model::FieldValue;
use crate::source::{parse_source_date, replace_html_elements};
use serde_json::Value;
use tracing::{debug, warn};

/// Text of a scalar source value
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Copy the value, keeping numbers numeric
pub fn map_identity(value: &Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Empty,
        Value::Number(n) => n.as_f64().map_or(FieldValue::Empty, FieldValue::Number),
        other => value_text(other).map_or(FieldValue::Empty, FieldValue::String),
    }
}

/// Translate through the rule's value table; unmapped values pass through
pub fn map_value(value: &Value, mapping: Option<&ValueMapping>) -> FieldValue {
    let Some(text) = value_text(value) else {
        return FieldValue::Empty;
    };
    match mapping.and_then(|m| m.values.iter().find(|v| v.source == text)) {
        Some(pair) => FieldValue::String(pair.target.clone()),
        None => {
            debug!("No value mapping for '{}', keeping it", text);
            FieldValue::String(text)
        }
    }
}

/// Space or comma separated labels become a `; ` separated tag list
pub fn map_tags(value: &Value) -> FieldValue {
    let Some(text) = value_text(value) else {
        return FieldValue::Empty;
    };
    let tags: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .collect();
    if tags.is_empty() {
        FieldValue::Empty
    } else {
        FieldValue::String(tags.join("; "))
    }
}

/// Comma separated values become a `;` separated list
pub fn map_array(value: &Value) -> FieldValue {
    let Some(text) = value_text(value) else {
        return FieldValue::Empty;
    };
    let items: Vec<&str> = text.split(',').map(str::trim).filter(|t| !t.is_empty()).collect();
    if items.is_empty() {
        FieldValue::Empty
    } else {
        FieldValue::String(items.join(";"))
    }
}

/// The most recent of the listed sprints, used as the iteration leaf
pub fn map_sprint(value: &Value) -> FieldValue {
    value_text(value)
        .and_then(|text| {
            text.split(',')
                .map(str::trim)
                .rfind(|s| !s.is_empty())
                .map(str::to_string)
        })
        .map_or(FieldValue::Empty, FieldValue::String)
}

pub fn map_number(value: &Value) -> Option<FieldValue> {
    match value {
        Value::Null => Some(FieldValue::Empty),
        Value::Number(n) => n.as_f64().map(FieldValue::Number),
        other => {
            let text = value_text(other)?;
            if text.trim().is_empty() {
                return Some(FieldValue::Empty);
            }
            match text.trim().parse::<f64>() {
                Ok(n) => Some(FieldValue::Number(n)),
                Err(_) => {
                    warn!("Cannot map '{}' to a number, skipping", text);
                    None
                }
            }
        }
    }
}

pub fn map_date(value: &Value) -> Option<FieldValue> {
    let Some(text) = value_text(value) else {
        return Some(FieldValue::Empty);
    };
    match parse_source_date(text.trim()) {
        Ok(date) => Some(FieldValue::Date(date)),
        Err(e) => {
            warn!("Cannot map '{}' to a date: {}", text, e);
            None
        }
    }
}

/// Rich text, preferring the source's HTML rendering when it applies
///
/// `rendered` is only passed when the revision holds the field's current value.
/// Plain text is escaped and line breaks kept.
pub fn map_rendered(value: &Value, rendered: Option<&str>) -> Option<FieldValue> {
    let html = match (rendered, value_text(value)) {
        (_, None) => return Some(FieldValue::Empty),
        (Some(html), Some(_)) => html.to_string(),
        (None, Some(text)) => text_to_html(&text),
    };
    match replace_html_elements(Some(&html)) {
        Ok(html) => Some(FieldValue::String(html)),
        Err(e) => {
            warn!("Cannot normalize rich text: {}", e);
            None
        }
    }
}

fn text_to_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace("\r\n", "\n")
        .replace('\n', "<br/>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValuePair;
    use serde_json::json;

    #[test]
    fn test_map_value_table() {
        let mapping = ValueMapping {
            values: vec![ValuePair {
                source: "In Progress".into(),
                target: "Active".into(),
            }],
        };
        assert_eq!(
            map_value(&json!("In Progress"), Some(&mapping)),
            FieldValue::String("Active".into())
        );
        assert_eq!(
            map_value(&json!("Blocked"), Some(&mapping)),
            FieldValue::String("Blocked".into())
        );
        assert_eq!(map_value(&Value::Null, Some(&mapping)), FieldValue::Empty);
    }

    #[test]
    fn test_map_tags_and_array() {
        assert_eq!(map_tags(&json!("one two, three")), FieldValue::String("one; two; three".into()));
        assert_eq!(map_tags(&json!("  ")), FieldValue::Empty);
        assert_eq!(map_array(&json!("a, b,,c")), FieldValue::String("a;b;c".into()));
    }

    #[test]
    fn test_map_sprint_takes_latest() {
        assert_eq!(map_sprint(&json!("Sprint 1, Sprint 2")), FieldValue::String("Sprint 2".into()));
        assert_eq!(map_sprint(&Value::Null), FieldValue::Empty);
    }

    #[test]
    fn test_map_number_and_date() {
        assert_eq!(map_number(&json!("3.5")), Some(FieldValue::Number(3.5)));
        assert_eq!(map_number(&json!(8)), Some(FieldValue::Number(8.0)));
        assert_eq!(map_number(&json!("many")), None);
        assert!(matches!(map_date(&json!("2023-04-01")), Some(FieldValue::Date(_))));
        assert_eq!(map_date(&Value::Null), Some(FieldValue::Empty));
    }

    #[test]
    fn test_map_rendered() {
        let rendered = r#"<p><span class="image-wrap">(<img src="a.png" />)</span></p>"#;
        assert_eq!(
            map_rendered(&json!("!a.png!"), Some(rendered)),
            Some(FieldValue::String(r#"<p><img src="a.png" /></p>"#.into()))
        );
        assert_eq!(
            map_rendered(&json!("a < b\nnext"), None),
            Some(FieldValue::String("a &lt; b<br/>next".into()))
        );
    }

    #[test]
    fn test_identity_keeps_numbers() {
        assert_eq!(map_identity(&json!(2)), FieldValue::Number(2.0));
        assert_eq!(map_identity(&json!("x")), FieldValue::String("x".into()));
        assert_eq!(map_identity(&Value::Null), FieldValue::Empty);
    }
}
