//! Collaborator traits for the bot backend and agent routing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    handoff::{AgentRef, HandoffPayload},
    message::{Content, Message, TurnFailure},
    session::SessionId,
};

/// A bot's answer to one user input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotReply {
    pub content: Content,
    /// The bot asks for a human to take over after this reply.
    #[serde(default)]
    pub escalate: bool,
}

impl BotReply {
    #[must_use]
    pub fn new(content: impl Into<Content>) -> Self {
        Self {
            content: content.into(),
            escalate: false,
        }
    }

    /// A reply that also escalates to a human agent.
    #[must_use]
    pub fn escalating(content: impl Into<Content>) -> Self {
        Self {
            content: content.into(),
            escalate: true,
        }
    }
}

/// Bot service error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("Bot service timed out")]
    Timeout,
    #[error("Bot service unavailable")]
    Unavailable,
    #[error("Bot service failed: {0}")]
    Failed(String),
}

impl From<ServiceError> for TurnFailure {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Timeout => Self::Timeout,
            other => Self::Service {
                message: other.to_string(),
            },
        }
    }
}

/// Trait for the bot backend.
///
/// Implement this against whatever NLU or LLM service answers the widget.
#[async_trait]
pub trait BotService: Send + Sync {
    /// Send one user input and wait for the reply.
    async fn send_user_input(
        &self,
        session_id: SessionId,
        content: &Content,
    ) -> Result<BotReply, ServiceError>;
}

/// Answer from an agent-routing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RoutingDecision {
    /// An agent took the conversation.
    Accepted { agent: AgentRef },
    /// No agent will take it.
    Rejected { reason: String },
    /// The answer will arrive later as an explicit accept/reject.
    Deferred,
}

/// Agent routing error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("Agent routing unavailable")]
    Unavailable,
    #[error("Agent routing failed: {0}")]
    Failed(String),
}

/// Trait for handing conversations to human agents.
#[async_trait]
pub trait AgentRouter: Send + Sync {
    /// Offer a conversation to the agent side. Takes ownership of the payload.
    async fn route_handoff(&self, payload: HandoffPayload) -> Result<RoutingDecision, RoutingError>;

    /// Pass user input to the serving agent.
    async fn relay_user_input(&self, _agent: &AgentRef, _message: &Message) -> Result<(), RoutingError> {
        Ok(())
    }
}

/// Router that always defers; acceptance comes from an explicit
/// `accept_handoff` dispatch, e.g. an agent console.
#[derive(Debug, Default, Clone)]
pub struct ManualRouting;

#[async_trait]
impl AgentRouter for ManualRouting {
    async fn route_handoff(&self, payload: HandoffPayload) -> Result<RoutingDecision, RoutingError> {
        tracing::debug!(attempt = %payload.attempt(), "Handoff awaiting manual acceptance");
        Ok(RoutingDecision::Deferred)
    }
}
