// src/model/iteration.rs

//! Iteration (sprint) records exported alongside items

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An iteration as persisted in the workspace, keyed by name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WiIteration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl WiIteration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin_id: None,
            state: None,
            goal: None,
            start_date: None,
            end_date: None,
        }
    }
}
