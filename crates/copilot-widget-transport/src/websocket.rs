//! WebSocket transport for browser-hosted widgets.
//!
//! `/ws` mounts a fresh session per connection and unmounts it on
//! disconnect and speaks for the user. `/ws/{session_id}` attaches to a
//! mounted session as an agent console.

use std::sync::Arc;

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use copilot_widget_core::{AgentRouter, BotService, SessionId, SessionMetadata};
use copilot_widget_session::{SessionContext, SessionManager};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ClientRole, ServerMessage, TransportError, events_after};

/// WebSocket handler state.
pub struct WsState<B, R>
where
    B: BotService + 'static,
    R: AgentRouter + 'static,
{
    /// Sessions served by this router.
    pub manager: Arc<SessionManager<B, R>>,
}

impl<B, R> Clone for WsState<B, R>
where
    B: BotService + 'static,
    R: AgentRouter + 'static,
{
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<B, R> WsState<B, R>
where
    B: BotService + 'static,
    R: AgentRouter + 'static,
{
    /// Create new WebSocket state.
    #[must_use]
    pub const fn new(manager: Arc<SessionManager<B, R>>) -> Self {
        Self { manager }
    }
}

/// Upgrade handler that mounts a new session.
pub async fn ws_handler<B, R>(ws: WebSocketUpgrade, State(state): State<WsState<B, R>>) -> Response
where
    B: BotService + 'static,
    R: AgentRouter + 'static,
{
    ws.on_upgrade(move |socket| async move {
        let ctx = state.manager.mount(SessionMetadata::new()).await;
        let id = ctx.id();
        handle_socket(socket, ctx, ClientRole::Widget).await;
        if let Err(e) = state.manager.unmount(id).await {
            tracing::debug!(session_id = %id, "Unmount after disconnect: {e}");
        }
    })
}

/// Upgrade handler that attaches to a mounted session.
pub async fn attach_handler<B, R>(
    ws: WebSocketUpgrade,
    Path(session_id): Path<SessionId>,
    State(state): State<WsState<B, R>>,
) -> Response
where
    B: BotService + 'static,
    R: AgentRouter + 'static,
{
    match state.manager.get(session_id).await {
        Some(ctx) => ws.on_upgrade(move |socket| handle_socket(socket, ctx, ClientRole::Agent)),
        None => (StatusCode::NOT_FOUND, "session not found").into_response(),
    }
}

async fn handle_socket(socket: WebSocket, ctx: SessionContext, role: ClientRole) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Subscribe before taking the snapshot so no change falls in between,
    // then skip what the snapshot already shows.
    let stream = ctx.event_stream();
    let view = ctx.view();
    let mut events = Box::pin(events_after(stream, view.seq));
    let _ = tx.send(ServerMessage::Snapshot { view });

    let event_tx = tx.clone();
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if event_tx.send(ServerMessage::Event { event }).is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!(session_id = %ctx.id(), "WebSocket error: {e}");
                break;
            }
        };

        let reply = match ClientMessage::parse(&text) {
            Ok(client_msg) => client_msg.apply(&ctx, role).await,
            Err(e) => Err(e),
        };
        match reply {
            Ok(Some(msg)) => {
                let _ = tx.send(msg);
            }
            Ok(None) => {}
            Err(e) => {
                if matches!(
                    e,
                    TransportError::InvalidMessage(_) | TransportError::Forbidden { .. }
                ) {
                    tracing::warn!(session_id = %ctx.id(), ?role, "Refused client message: {e}");
                }
                let _ = tx.send(e.into());
            }
        }
    }

    event_task.abort();
    send_task.abort();
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let manager = Arc::new(SessionManager::new(bot, ManualRouting, SessionConfig::default()));
/// let app = Router::new().merge(create_ws_router(manager));
/// ```
#[must_use]
pub fn create_ws_router<B, R>(manager: Arc<SessionManager<B, R>>) -> axum::Router
where
    B: BotService + 'static,
    R: AgentRouter + 'static,
{
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler::<B, R>))
        .route("/ws/{session_id}", axum::routing::get(attach_handler::<B, R>))
        .with_state(WsState::new(manager))
}
