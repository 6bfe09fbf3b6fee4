//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one session context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Buffered notifications per subscriber before it starts lagging.
    pub event_capacity: usize,
    /// Bound of the intent queue.
    pub intent_capacity: usize,
    /// Fail a bot turn with `Timeout` when no reply arrives in time.
    pub reply_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            intent_capacity: 256,
            reply_timeout_ms: None,
        }
    }
}

impl SessionConfig {
    /// Set the reply timeout.
    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_ms.map(Duration::from_millis)
    }
}
