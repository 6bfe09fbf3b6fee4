//! Per-session metadata.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Metadata key under which the accepting agent is recorded.
pub const AGENT_REF_KEY: &str = "agent_ref";

/// String metadata attached to a session at mount time.
///
/// Hosts put whatever they need here (page URL, user id, locale); the
/// session adds `agent_ref` once a handoff is accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionMetadata {
    entries: HashMap<String, String>,
}

impl SessionMetadata {
    /// Empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata from existing entries.
    #[must_use]
    pub const fn with_entries(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Set a metadata value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// All entries.
    #[must_use]
    pub const fn entries(&self) -> &HashMap<String, String> {
        &self.entries
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SessionMetadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
