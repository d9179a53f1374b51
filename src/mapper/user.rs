// src/mapper/user.rs

//! Source to target user identity mapping

use crate::Result;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Key of the default identity entry
pub const DEFAULT_USER_KEY: &str = "*";

/// Identity table loaded from a `source=target` mapping file
#[derive(Debug, Clone, Default)]
pub struct UserMapping {
    users: HashMap<String, String>,
}

impl UserMapping {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    /// Load a mapping file; a missing file yields an empty table with a warning
    ///
    /// Lines are `source=target`. Blank lines and `#` comments are ignored, and
    /// for repeated source identities the first line wins.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.is_file() {
            warn!("User mapping file '{}' not found.", path.display());
            return Ok(Self::default());
        }
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    pub fn parse(content: &str) -> Self {
        let mut users = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((source, target)) if !source.trim().is_empty() => {
                    users
                        .entry(source.trim().to_string())
                        .or_insert_with(|| target.trim().to_string());
                }
                _ => warn!("Ignoring malformed user mapping line '{}'", line),
            }
        }
        Self { users }
    }

    /// Resolve a source identity
    ///
    /// Falls back to the `*` entry, then to the source identity itself. The
    /// latter is cached so the warning is logged once per identity.
    pub fn map_user(&mut self, source_user: &str) -> String {
        if let Some(target) = self.users.get(source_user) {
            return target.clone();
        }
        if let Some(default) = self.users.get(DEFAULT_USER_KEY) {
            warn!(
                "Could not find user '{}' identity in user map. Using default identity '{}'.",
                source_user, default
            );
            return default.clone();
        }
        warn!(
            "Could not find user '{}' identity in user map. Using original identity '{}'.",
            source_user, source_user
        );
        self.users
            .insert(source_user.to_string(), source_user.to_string());
        source_user.to_string()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
