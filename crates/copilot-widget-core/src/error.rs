//! Error taxonomy for session operations.

use thiserror::Error;

use crate::{
    handoff::SessionMode,
    message::{Author, MessageId, MessageStatus},
};

/// A message viewed as the wrong kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Expected a {expected:?} message, found {found:?}")]
pub struct AuthorMismatch {
    pub expected: Author,
    pub found: Author,
}

/// Message store misuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Message not found: {0}")]
    NotFound(MessageId),
    #[error("Invalid transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },
}

/// Failure of a dispatched session operation.
///
/// Every variant is returned before any state is touched, so a failed
/// operation never leaves a partial mutation behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("{operation} is not valid while the session is {mode:?}")]
    InvalidState {
        operation: &'static str,
        mode: SessionMode,
    },
    #[error("A turn is already in progress: {0}")]
    TurnInProgress(MessageId),
    #[error("Turn already resolved: {0}")]
    AlreadyResolved(MessageId),
    #[error("Message not found: {0}")]
    NotFound(MessageId),
    #[error("Invalid transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("Session is closed")]
    SessionClosed,
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::InvalidTransition { id, from, to } => {
                Self::InvalidTransition { id, from, to }
            }
        }
    }
}

impl SessionError {
    /// Whether the session can never accept another operation.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionClosed)
    }
}
