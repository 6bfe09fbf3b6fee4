//! Wire protocol for widget-server communication.

use std::collections::HashMap;

use copilot_widget_core::{AgentRef, Content, HandoffReason, SessionError, SessionView};
use copilot_widget_session::{SessionContext, SessionEvent};
use futures::{Stream, StreamExt, future};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which side of the conversation a connection speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// The end user's widget.
    Widget,
    /// An agent console attached to a mounted session.
    Agent,
}

/// Message from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// User typed something.
    SubmitInput { content: Content },
    /// Ask for a human agent.
    RequestHandoff {
        reason: HandoffReason,
        #[serde(default)]
        metadata: HashMap<String, String>,
    },
    /// An agent console takes the open handoff.
    AcceptHandoff { agent: AgentRef },
    /// An agent console declines the open handoff.
    RejectHandoff { reason: String },
    /// An agent console writes to the user.
    AgentMessage { content: Content },
    /// End the conversation.
    Close,
    /// Ping for keepalive.
    Ping,
}

/// Message from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full state, sent once on connect.
    Snapshot { view: SessionView },
    /// One state change.
    Event { event: SessionEvent },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
    #[error("{message} is not allowed from a {role:?} connection")]
    Forbidden {
        message: &'static str,
        role: ClientRole,
    },
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<TransportError> for ServerMessage {
    fn from(err: TransportError) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}

impl ClientMessage {
    /// Parse a text frame.
    ///
    /// # Errors
    /// Returns error if the frame is not a valid client message.
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire name of the message type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SubmitInput { .. } => "submit_input",
            Self::RequestHandoff { .. } => "request_handoff",
            Self::AcceptHandoff { .. } => "accept_handoff",
            Self::RejectHandoff { .. } => "reject_handoff",
            Self::AgentMessage { .. } => "agent_message",
            Self::Close => "close",
            Self::Ping => "ping",
        }
    }

    /// Whether a connection with `role` may send this message.
    ///
    /// Widgets speak for the user; only agent consoles settle handoffs or
    /// write agent messages.
    #[must_use]
    pub const fn allowed_for(&self, role: ClientRole) -> bool {
        match self {
            Self::Close | Self::Ping => true,
            Self::SubmitInput { .. } | Self::RequestHandoff { .. } => {
                matches!(role, ClientRole::Widget)
            }
            Self::AcceptHandoff { .. } | Self::RejectHandoff { .. } | Self::AgentMessage { .. } => {
                matches!(role, ClientRole::Agent)
            }
        }
    }

    /// Apply this message to `ctx` on behalf of a `role` connection.
    ///
    /// State changes reach the client as events, so only `Ping` produces a
    /// direct answer.
    ///
    /// # Errors
    /// `Forbidden` if `role` may not send this message, otherwise the
    /// session error of a refused dispatch.
    pub async fn apply(
        self,
        ctx: &SessionContext,
        role: ClientRole,
    ) -> Result<Option<ServerMessage>, TransportError> {
        if !self.allowed_for(role) {
            return Err(TransportError::Forbidden {
                message: self.kind(),
                role,
            });
        }
        match self {
            Self::SubmitInput { content } => {
                ctx.submit_user_input(content).await?;
            }
            Self::RequestHandoff { reason, metadata } => {
                ctx.request_handoff_with(reason, metadata).await?;
            }
            Self::AcceptHandoff { agent } => ctx.accept_handoff(agent).await?,
            Self::RejectHandoff { reason } => ctx.reject_handoff(reason).await?,
            Self::AgentMessage { content } => {
                ctx.post_agent_message(content).await?;
            }
            Self::Close => ctx.close().await?,
            Self::Ping => return Ok(Some(ServerMessage::Pong)),
        }
        Ok(None)
    }
}

/// Drop events already reflected in a snapshot taken at `seq`.
///
/// A connection subscribes before it snapshots, so changes applied in
/// between arrive both ways.
pub fn events_after<S>(events: S, seq: u64) -> impl Stream<Item = SessionEvent>
where
    S: Stream<Item = SessionEvent>,
{
    events.filter(move |event| future::ready(event.seq > seq))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use copilot_widget_core::{
        BotReply, BotService, ManualRouting, ServiceError, SessionId, SessionMetadata, SessionMode,
    };
    use copilot_widget_session::SessionConfig;

    use super::*;

    struct SilentBot;

    #[async_trait]
    impl BotService for SilentBot {
        async fn send_user_input(
            &self,
            _session_id: SessionId,
            _content: &Content,
        ) -> Result<BotReply, ServiceError> {
            Err(ServiceError::Unavailable)
        }
    }

    fn context() -> SessionContext {
        SessionContext::spawn(
            Arc::new(SilentBot),
            Arc::new(ManualRouting),
            SessionMetadata::new(),
            SessionConfig::default(),
        )
    }

    #[test]
    fn test_parse_client_messages() {
        let msg = ClientMessage::parse(
            r#"{"type":"submit_input","content":{"kind":"text","value":"Hello"}}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::SubmitInput { content: Content::Text(ref s) } if s == "Hello"
        ));

        let msg = ClientMessage::parse(r#"{"type":"request_handoff","reason":"user_requested"}"#).unwrap();
        if let ClientMessage::RequestHandoff { reason, metadata } = msg {
            assert_eq!(reason, HandoffReason::UserRequested);
            assert!(metadata.is_empty());
        } else {
            panic!("Wrong message type");
        }

        assert!(matches!(
            ClientMessage::parse(r#"{"type":"resize"}"#),
            Err(TransportError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_error_message_serialization() {
        let msg = ServerMessage::from(TransportError::Session(SessionError::SessionClosed));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains("Session is closed"));
    }

    #[tokio::test]
    async fn test_apply_dispatches() {
        let ctx = context();

        let pong = ClientMessage::Ping.apply(&ctx, ClientRole::Widget).await.unwrap();
        assert!(matches!(pong, Some(ServerMessage::Pong)));

        ClientMessage::RequestHandoff {
            reason: HandoffReason::UserRequested,
            metadata: HashMap::new(),
        }
        .apply(&ctx, ClientRole::Widget)
        .await
        .unwrap();
        ClientMessage::AcceptHandoff {
            agent: AgentRef::new("console"),
        }
        .apply(&ctx, ClientRole::Agent)
        .await
        .unwrap();
        assert_eq!(ctx.mode(), SessionMode::AgentServed);

        let err = ClientMessage::RejectHandoff {
            reason: "too late".into(),
        }
        .apply(&ctx, ClientRole::Agent)
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Session(SessionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_widget_cannot_act_as_agent() {
        let ctx = context();
        ClientMessage::RequestHandoff {
            reason: HandoffReason::UserRequested,
            metadata: HashMap::new(),
        }
        .apply(&ctx, ClientRole::Widget)
        .await
        .unwrap();

        let err = ClientMessage::AcceptHandoff {
            agent: AgentRef::new("me"),
        }
        .apply(&ctx, ClientRole::Widget)
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Forbidden {
                message: "accept_handoff",
                role: ClientRole::Widget,
            }
        ));
        assert!(matches!(ServerMessage::from(err), ServerMessage::Error { .. }));

        let err = ClientMessage::AgentMessage {
            content: "fake agent".into(),
        }
        .apply(&ctx, ClientRole::Widget)
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Forbidden { .. }));
        assert_eq!(ctx.mode(), SessionMode::HandoffRequested);
        assert!(ctx.transcript().is_empty());

        let err = ClientMessage::SubmitInput {
            content: "not a user".into(),
        }
        .apply(&ctx, ClientRole::Agent)
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn test_events_after_snapshot_seq() {
        let ctx = context();
        let events = ctx.event_stream();
        ClientMessage::RequestHandoff {
            reason: HandoffReason::UserRequested,
            metadata: HashMap::new(),
        }
        .apply(&ctx, ClientRole::Widget)
        .await
        .unwrap();

        // Snapshot taken after the change already covers it.
        let view = ctx.view();
        assert_eq!(view.seq, 1);
        ClientMessage::RejectHandoff {
            reason: "busy".into(),
        }
        .apply(&ctx, ClientRole::Agent)
        .await
        .unwrap();
        ctx.close().await.unwrap();

        let seqs: Vec<_> = events_after(events, view.seq)
            .take(2)
            .map(|e| e.seq)
            .collect()
            .await;
        assert_eq!(seqs, vec![2, 3]);
    }
}
