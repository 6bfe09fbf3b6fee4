//! Transcript messages.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AuthorMismatch;

/// Message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    User,
    Bot,
    Agent,
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting on an external reply.
    Pending,
    /// Final, successfully delivered.
    Delivered,
    /// Final, the reply never arrived.
    Failed,
}

impl MessageStatus {
    /// `Pending` may move once, to either final status. Final statuses never move.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Delivered | Self::Failed)
        )
    }

    #[must_use]
    pub const fn is_final(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Content {
    Text(String),
    /// Structured payload, e.g. a bot-rendered card.
    Structured(Value),
}

impl Content {
    /// Plain text content.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// The text body, if this is text content.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Structured(_) => None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Structured(v) => v.is_null(),
        }
    }
}

impl Default for Content {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Value> for Content {
    fn from(v: Value) -> Self {
        Self::Structured(v)
    }
}

/// Why a turn ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnFailure {
    /// The reply deadline passed.
    Timeout,
    /// The bot service reported an error.
    Service { message: String },
    /// The session closed while the turn was in flight.
    Cancelled,
}

impl fmt::Display for TurnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out waiting for a reply"),
            Self::Service { message } => write!(f, "service error: {message}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author: Author,
    pub content: Content,
    pub status: MessageStatus,
    /// Set only when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TurnFailure>,
    /// Creation timestamp (Unix epoch milliseconds).
    pub created_at: i64,
}

impl Message {
    /// A user message. Accepted input is always delivered.
    #[must_use]
    pub fn user(content: impl Into<Content>) -> Self {
        Self::new(Author::User, content.into(), MessageStatus::Delivered)
    }

    /// A bot placeholder awaiting its reply.
    #[must_use]
    pub fn pending_bot() -> Self {
        Self::new(Author::Bot, Content::default(), MessageStatus::Pending)
    }

    /// A message written by a human agent.
    #[must_use]
    pub fn agent(content: impl Into<Content>) -> Self {
        Self::new(Author::Agent, content.into(), MessageStatus::Delivered)
    }

    fn new(author: Author, content: Content, status: MessageStatus) -> Self {
        Self {
            id: MessageId::new(),
            author,
            content,
            status,
            failure: None,
            created_at: now_millis(),
        }
    }
}

/// A transcript entry known to be user input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UserMessageType<'a>(&'a Message);

impl<'a> UserMessageType<'a> {
    #[must_use]
    pub const fn id(self) -> MessageId {
        self.0.id
    }

    #[must_use]
    pub const fn content(self) -> &'a Content {
        &self.0.content
    }

    #[must_use]
    pub const fn message(self) -> &'a Message {
        self.0
    }
}

impl<'a> TryFrom<&'a Message> for UserMessageType<'a> {
    type Error = AuthorMismatch;

    fn try_from(message: &'a Message) -> Result<Self, Self::Error> {
        match message.author {
            Author::User => Ok(Self(message)),
            found => Err(AuthorMismatch {
                expected: Author::User,
                found,
            }),
        }
    }
}

/// A transcript entry known to be a bot reply, pending or settled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BotMessageType<'a>(&'a Message);

impl<'a> BotMessageType<'a> {
    #[must_use]
    pub const fn id(self) -> MessageId {
        self.0.id
    }

    #[must_use]
    pub const fn content(self) -> &'a Content {
        &self.0.content
    }

    #[must_use]
    pub const fn status(self) -> MessageStatus {
        self.0.status
    }

    #[must_use]
    pub const fn is_pending(self) -> bool {
        !self.0.status.is_final()
    }

    /// Why the reply failed, if it did.
    #[must_use]
    pub const fn failure(self) -> Option<&'a TurnFailure> {
        self.0.failure.as_ref()
    }

    #[must_use]
    pub const fn message(self) -> &'a Message {
        self.0
    }
}

impl<'a> TryFrom<&'a Message> for BotMessageType<'a> {
    type Error = AuthorMismatch;

    fn try_from(message: &'a Message) -> Result<Self, Self::Error> {
        match message.author {
            Author::Bot => Ok(Self(message)),
            found => Err(AuthorMismatch {
                expected: Author::Bot,
                found,
            }),
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
