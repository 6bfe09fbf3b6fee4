//! Single-flight turn bookkeeping.

use crate::{
    error::SessionError,
    message::{Author, Content, Message, MessageId, TurnFailure},
    msg_store::MessageStore,
};

/// Outcome reported for a pending bot turn.
pub type TurnResult = Result<Content, TurnFailure>;

/// Ids created by an accepted user submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnStart {
    /// The user's message, already delivered.
    pub user_message: MessageId,
    /// The bot placeholder, now the active turn.
    pub pending: MessageId,
}

/// Drives user-input/bot-reply cycles against a [`MessageStore`].
///
/// At most one bot turn is in flight at any time.
#[derive(Debug, Default)]
pub struct TurnCoordinator {
    active: Option<MessageId>,
}

impl TurnCoordinator {
    #[must_use]
    pub const fn new() -> Self {
        Self { active: None }
    }

    /// The pending bot message, if a turn is in flight.
    #[must_use]
    pub const fn active_turn(&self) -> Option<MessageId> {
        self.active
    }

    const fn ensure_idle(&self) -> Result<(), SessionError> {
        match self.active {
            Some(id) => Err(SessionError::TurnInProgress(id)),
            None => Ok(()),
        }
    }

    /// Append the user's message and a pending bot placeholder.
    ///
    /// # Errors
    /// `TurnInProgress` while another turn is in flight.
    pub fn submit_user_input(
        &mut self,
        store: &mut MessageStore,
        content: Content,
    ) -> Result<TurnStart, SessionError> {
        self.ensure_idle()?;

        let user_message = store.append(Message::user(content));
        let pending = store.append(Message::pending_bot());
        self.active = Some(pending);

        Ok(TurnStart {
            user_message,
            pending,
        })
    }

    /// Append the user's message without waiting on a bot reply.
    ///
    /// Used once a human agent is serving the session.
    ///
    /// # Errors
    /// `TurnInProgress` while a bot turn is still in flight.
    pub fn record_user_input(
        &mut self,
        store: &mut MessageStore,
        content: Content,
    ) -> Result<MessageId, SessionError> {
        self.ensure_idle()?;
        Ok(store.append(Message::user(content)))
    }

    /// Settle the pending turn `id` and clear the active turn.
    ///
    /// # Errors
    /// `NotFound` if `id` is not a bot turn, `AlreadyResolved` if it has
    /// already been settled. Neither touches the transcript.
    pub fn resolve_turn(
        &mut self,
        store: &mut MessageStore,
        id: MessageId,
        result: TurnResult,
    ) -> Result<(), SessionError> {
        if self.active != Some(id) {
            return Err(match store.get(id) {
                Some(msg) if msg.author == Author::Bot && msg.status.is_final() => {
                    SessionError::AlreadyResolved(id)
                }
                _ => SessionError::NotFound(id),
            });
        }

        match result {
            Ok(content) => store.deliver(id, content)?,
            Err(failure) => store.fail(id, failure)?,
        }
        self.active = None;
        Ok(())
    }

    /// Fail the in-flight turn as cancelled. Returns its id, if there was one.
    pub fn cancel(&mut self, store: &mut MessageStore) -> Option<MessageId> {
        let id = self.active.take()?;
        if let Err(e) = store.fail(id, TurnFailure::Cancelled) {
            tracing::warn!(message_id = %id, "Active turn was not pending: {e}");
        }
        Some(id)
    }
}
