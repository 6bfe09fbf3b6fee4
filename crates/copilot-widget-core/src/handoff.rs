//! Handoff state machine.
//!
//! Modes move `BotServed -> HandoffRequested -> {AgentServed, BotServed}`,
//! and any mode may move to `Closed`. Once an agent has accepted, the session
//! never returns to the bot.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::SessionError, message::Message, session::SessionId};

/// Who is serving the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    BotServed,
    HandoffRequested,
    AgentServed,
    Closed,
}

impl SessionMode {
    /// Whether `self -> next` is an allowed edge.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::BotServed, Self::HandoffRequested)
                | (Self::HandoffRequested, Self::AgentServed | Self::BotServed)
                | (
                    Self::BotServed | Self::HandoffRequested | Self::AgentServed,
                    Self::Closed
                )
        )
    }

    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Why a handoff was requested.
///
/// New triggers may be added; match with a wildcard arm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum HandoffReason {
    UserRequested,
    BotEscalation,
    PolicyTrigger,
}

/// Identifier of one handoff attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandoffId(Uuid);

impl HandoffId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandoffId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandoffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Reference to the human agent that took over a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentRef(String);

impl AgentRef {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything an agent-routing service needs to pick up a conversation.
///
/// Built once per attempt and never modified; the router takes ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffPayload {
    attempt: HandoffId,
    session_id: SessionId,
    reason: HandoffReason,
    context: Vec<Message>,
    metadata: HashMap<String, String>,
}

/// Name used by widget hosts for the routing payload.
pub type HandoffPayloadType = HandoffPayload;

impl HandoffPayload {
    #[must_use]
    pub const fn attempt(&self) -> HandoffId {
        self.attempt
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub const fn reason(&self) -> &HandoffReason {
        &self.reason
    }

    /// Transcript as it stood when the handoff was requested.
    #[must_use]
    pub fn context(&self) -> &[Message] {
        &self.context
    }

    #[must_use]
    pub const fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

/// A mode transition that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChange {
    pub from: SessionMode,
    pub to: SessionMode,
}

/// Owns the session mode and the open handoff attempt, if any.
#[derive(Debug)]
pub struct HandoffController {
    mode: SessionMode,
    attempt: Option<HandoffId>,
    agent: Option<AgentRef>,
}

impl Default for HandoffController {
    fn default() -> Self {
        Self::new()
    }
}

impl HandoffController {
    /// A controller in `BotServed` mode.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mode: SessionMode::BotServed,
            attempt: None,
            agent: None,
        }
    }

    #[must_use]
    pub const fn mode(&self) -> SessionMode {
        self.mode
    }

    /// The open attempt while in `HandoffRequested`.
    #[must_use]
    pub const fn attempt(&self) -> Option<HandoffId> {
        self.attempt
    }

    /// The accepting agent once in `AgentServed`.
    #[must_use]
    pub const fn agent(&self) -> Option<&AgentRef> {
        self.agent.as_ref()
    }

    /// Fail with `SessionClosed` once the session has closed.
    ///
    /// # Errors
    /// `SessionClosed` in `Closed` mode.
    pub const fn ensure_open(&self) -> Result<(), SessionError> {
        if self.mode.is_closed() {
            Err(SessionError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn expect_mode(&self, operation: &'static str, expected: SessionMode) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.mode == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                mode: self.mode,
            })
        }
    }

    fn expect_attempt(
        &self,
        operation: &'static str,
        attempt: Option<HandoffId>,
    ) -> Result<(), SessionError> {
        self.expect_mode(operation, SessionMode::HandoffRequested)?;
        match attempt {
            Some(attempt) if self.attempt != Some(attempt) => Err(SessionError::InvalidState {
                operation,
                mode: self.mode,
            }),
            _ => Ok(()),
        }
    }

    fn set_mode(&mut self, to: SessionMode) -> ModeChange {
        debug_assert!(self.mode.can_transition_to(to), "{:?} -> {to:?}", self.mode);
        let change = ModeChange {
            from: self.mode,
            to,
        };
        self.mode = to;
        change
    }

    /// Start a handoff attempt from `BotServed`.
    ///
    /// `context` must be a snapshot of the transcript at call time.
    ///
    /// # Errors
    /// `SessionClosed` after close, `InvalidState` outside `BotServed`.
    pub fn request_handoff(
        &mut self,
        session_id: SessionId,
        reason: HandoffReason,
        metadata: HashMap<String, String>,
        context: Vec<Message>,
    ) -> Result<HandoffPayload, SessionError> {
        self.expect_mode("request_handoff", SessionMode::BotServed)?;

        let attempt = HandoffId::new();
        self.attempt = Some(attempt);
        self.set_mode(SessionMode::HandoffRequested);

        Ok(HandoffPayload {
            attempt,
            session_id,
            reason,
            context,
            metadata,
        })
    }

    /// Accept the open attempt. When `attempt` is given it must match the
    /// open one, so a late answer to an abandoned attempt is refused.
    ///
    /// # Errors
    /// `SessionClosed` after close, `InvalidState` outside `HandoffRequested`
    /// or for a superseded attempt.
    pub fn accept_handoff(
        &mut self,
        attempt: Option<HandoffId>,
        agent: AgentRef,
    ) -> Result<ModeChange, SessionError> {
        self.expect_attempt("accept_handoff", attempt)?;
        self.attempt = None;
        self.agent = Some(agent);
        Ok(self.set_mode(SessionMode::AgentServed))
    }

    /// Abort the open attempt and hand the session back to the bot.
    ///
    /// # Errors
    /// Same as [`Self::accept_handoff`].
    pub fn reject_handoff(&mut self, attempt: Option<HandoffId>) -> Result<ModeChange, SessionError> {
        self.expect_attempt("reject_handoff", attempt)?;
        self.attempt = None;
        Ok(self.set_mode(SessionMode::BotServed))
    }

    /// Close the session from any open mode.
    ///
    /// # Errors
    /// `SessionClosed` if already closed.
    pub fn close(&mut self) -> Result<ModeChange, SessionError> {
        self.ensure_open()?;
        self.attempt = None;
        Ok(self.set_mode(SessionMode::Closed))
    }
}
