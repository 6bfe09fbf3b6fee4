//! The session aggregate: one transcript, one turn coordinator, one handoff
//! controller, mutated by a single owner.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    context::{AGENT_REF_KEY, SessionMetadata},
    error::SessionError,
    handoff::{AgentRef, HandoffController, HandoffId, HandoffPayload, HandoffReason, SessionMode},
    message::{Content, Message, MessageId},
    msg_store::MessageStore,
    turn::{TurnCoordinator, TurnResult, TurnStart},
};

/// Session identifier.
pub type SessionId = Uuid;

/// Read-only projection handed to rendering collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: SessionId,
    /// Number of changes applied so far. Matches the `seq` of the last
    /// notification, so a subscriber can drop events it already saw here.
    #[serde(default)]
    pub seq: u64,
    pub mode: SessionMode,
    pub transcript: Vec<Message>,
    pub active_turn: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentRef>,
}

/// The single observable change produced by a successful operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateChange {
    /// User input accepted and a bot reply is awaited.
    TurnStarted { user: Message, pending: Message },
    /// User input accepted and passed to the serving agent.
    InputRelayed { message: Message, agent: AgentRef },
    /// A bot turn settled as delivered or failed.
    TurnResolved { message: Message },
    /// The serving agent wrote a message.
    AgentMessage { message: Message },
    HandoffRequested {
        attempt: HandoffId,
        reason: HandoffReason,
    },
    HandoffAccepted { agent: AgentRef },
    HandoffRejected { reason: String },
    /// The session closed; `cancelled_turn` was in flight at the time.
    Closed { cancelled_turn: Option<MessageId> },
}

/// What `submit_user_input` did with the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// A bot turn started.
    Turn(TurnStart),
    /// The input went to the serving agent; no turn is pending.
    Relayed {
        user_message: MessageId,
        agent: AgentRef,
    },
}

/// A successful operation's output together with its state change.
#[derive(Debug, Clone)]
pub struct Applied<T> {
    pub output: T,
    pub change: StateChange,
}

impl<T> Applied<T> {
    const fn new(output: T, change: StateChange) -> Self {
        Self { output, change }
    }
}

/// One widget conversation from mount to close.
///
/// Every operation either applies completely and reports one
/// [`StateChange`], or fails without touching anything.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    metadata: SessionMetadata,
    store: MessageStore,
    turns: TurnCoordinator,
    handoff: HandoffController,
    seq: u64,
}

impl Session {
    /// A fresh bot-served session.
    #[must_use]
    pub fn new(metadata: SessionMetadata) -> Self {
        Self::with_id(Uuid::new_v4(), metadata)
    }

    #[must_use]
    pub fn with_id(id: SessionId, metadata: SessionMetadata) -> Self {
        Self {
            id,
            metadata,
            store: MessageStore::new(),
            turns: TurnCoordinator::new(),
            handoff: HandoffController::new(),
            seq: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Number of successful operations so far.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub const fn mode(&self) -> SessionMode {
        self.handoff.mode()
    }

    #[must_use]
    pub const fn active_turn(&self) -> Option<MessageId> {
        self.turns.active_turn()
    }

    #[must_use]
    pub const fn handoff_attempt(&self) -> Option<HandoffId> {
        self.handoff.attempt()
    }

    #[must_use]
    pub const fn agent(&self) -> Option<&AgentRef> {
        self.handoff.agent()
    }

    #[must_use]
    pub const fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    #[must_use]
    pub const fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Copy of the transcript.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.store.snapshot()
    }

    #[must_use]
    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id,
            seq: self.seq,
            mode: self.mode(),
            transcript: self.store.snapshot(),
            active_turn: self.active_turn(),
            agent: self.agent().cloned(),
        }
    }

    fn applied<T>(&mut self, output: T, change: StateChange) -> Applied<T> {
        self.seq += 1;
        Applied::new(output, change)
    }

    fn message(&self, id: MessageId) -> Result<Message, SessionError> {
        self.store.get(id).cloned().ok_or(SessionError::NotFound(id))
    }

    /// Accept user input.
    ///
    /// While the bot serves (including while a handoff is pending) this
    /// starts a turn; once an agent serves it records the input for relay.
    ///
    /// # Errors
    /// `SessionClosed` after close, `TurnInProgress` while a turn is in flight.
    pub fn submit_user_input(&mut self, content: Content) -> Result<Applied<Submission>, SessionError> {
        self.handoff.ensure_open()?;

        if let Some(agent) = self.handoff.agent().cloned() {
            let user_message = self.turns.record_user_input(&mut self.store, content)?;
            let message = self.message(user_message)?;
            return Ok(self.applied(
                Submission::Relayed {
                    user_message,
                    agent: agent.clone(),
                },
                StateChange::InputRelayed { message, agent },
            ));
        }

        let start = self.turns.submit_user_input(&mut self.store, content)?;
        let change = StateChange::TurnStarted {
            user: self.message(start.user_message)?,
            pending: self.message(start.pending)?,
        };
        Ok(self.applied(Submission::Turn(start), change))
    }

    /// Settle the pending bot turn `id`.
    ///
    /// # Errors
    /// `SessionClosed` after close (checked first, so a late reply can never
    /// land in a closed session), then `NotFound` or `AlreadyResolved`.
    pub fn resolve_turn(&mut self, id: MessageId, result: TurnResult) -> Result<Applied<Message>, SessionError> {
        self.handoff.ensure_open()?;
        self.turns.resolve_turn(&mut self.store, id, result)?;
        let message = self.message(id)?;
        Ok(self.applied(
            message.clone(),
            StateChange::TurnResolved { message },
        ))
    }

    /// Start a handoff attempt.
    ///
    /// # Errors
    /// `SessionClosed` after close, `InvalidState` outside `BotServed`.
    pub fn request_handoff(
        &mut self,
        reason: HandoffReason,
        metadata: HashMap<String, String>,
    ) -> Result<Applied<HandoffPayload>, SessionError> {
        let context = self.store.snapshot();
        let payload = self
            .handoff
            .request_handoff(self.id, reason.clone(), metadata, context)?;
        let change = StateChange::HandoffRequested {
            attempt: payload.attempt(),
            reason,
        };
        Ok(self.applied(payload, change))
    }

    /// Hand the session to `agent`. `attempt`, when given, must be the open
    /// attempt.
    ///
    /// # Errors
    /// `SessionClosed` after close, `InvalidState` outside `HandoffRequested`
    /// or for a superseded attempt.
    pub fn accept_handoff(
        &mut self,
        attempt: Option<HandoffId>,
        agent: AgentRef,
    ) -> Result<Applied<()>, SessionError> {
        self.handoff.accept_handoff(attempt, agent.clone())?;
        self.metadata.set(AGENT_REF_KEY, agent.as_str());
        Ok(self.applied((), StateChange::HandoffAccepted { agent }))
    }

    /// Abort the open attempt; the bot keeps serving.
    ///
    /// # Errors
    /// Same as [`Self::accept_handoff`].
    pub fn reject_handoff(
        &mut self,
        attempt: Option<HandoffId>,
        reason: String,
    ) -> Result<Applied<()>, SessionError> {
        self.handoff.reject_handoff(attempt)?;
        Ok(self.applied((), StateChange::HandoffRejected { reason }))
    }

    /// Append a message written by the serving agent.
    ///
    /// # Errors
    /// `SessionClosed` after close, `InvalidState` outside `AgentServed`.
    pub fn post_agent_message(&mut self, content: Content) -> Result<Applied<MessageId>, SessionError> {
        self.handoff.ensure_open()?;
        if self.mode() != SessionMode::AgentServed {
            return Err(SessionError::InvalidState {
                operation: "post_agent_message",
                mode: self.mode(),
            });
        }

        let id = self.store.append(Message::agent(content));
        let message = self.message(id)?;
        Ok(self.applied(id, StateChange::AgentMessage { message }))
    }

    /// Close the session, cancelling any in-flight turn and handoff attempt.
    ///
    /// # Errors
    /// `SessionClosed` if already closed.
    pub fn close(&mut self) -> Result<Applied<()>, SessionError> {
        self.handoff.close()?;
        let cancelled_turn = self.turns.cancel(&mut self.store);
        Ok(self.applied((), StateChange::Closed { cancelled_turn }))
    }
}
