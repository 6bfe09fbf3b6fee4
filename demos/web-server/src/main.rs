//! Demo server for the copilot chat widget.
//!
//! Run with: cargo run -p web-server-demo
//!
//! Then open http://localhost:3000 in your browser. Saying "human" makes the
//! bot escalate; open `/ws/<session_id>` from a second client to accept as
//! an agent.
//!
//! Environment:
//! - `WIDGET_ADDR` - listen address (default 127.0.0.1:3000)
//! - `WIDGET_REPLY_TIMEOUT_MS` - bot reply deadline
//! - `RUST_LOG` - log filter (default info)

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context as _;
use async_trait::async_trait;
use axum::{Router, response::Html, routing::get};
use copilot_widget_core::{BotReply, BotService, Content, ManualRouting, ServiceError, SessionId};
use copilot_widget_session::{SessionConfig, SessionManager};
use copilot_widget_transport::websocket::create_ws_router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Bot that echoes text and escalates when asked for a human.
struct EchoBot {
    delay: Duration,
}

#[async_trait]
impl BotService for EchoBot {
    async fn send_user_input(
        &self,
        session_id: SessionId,
        content: &Content,
    ) -> Result<BotReply, ServiceError> {
        tokio::time::sleep(self.delay).await;
        let text = content
            .as_text()
            .ok_or_else(|| ServiceError::Failed("only text is supported".into()))?;
        tracing::debug!(%session_id, "Echoing {} bytes", text.len());

        if text.to_lowercase().contains("human") {
            Ok(BotReply::escalating("Let me find a person to help you."))
        } else {
            Ok(BotReply::new(format!("You said: {text}")))
        }
    }
}

fn config_from_env() -> anyhow::Result<(SocketAddr, SessionConfig)> {
    let addr = std::env::var("WIDGET_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3000".into())
        .parse()
        .context("WIDGET_ADDR is not a socket address")?;

    let mut config = SessionConfig::default();
    if let Ok(ms) = std::env::var("WIDGET_REPLY_TIMEOUT_MS") {
        let ms: u64 = ms.parse().context("WIDGET_REPLY_TIMEOUT_MS is not a number")?;
        config = config.with_reply_timeout(Duration::from_millis(ms));
    }
    Ok((addr, config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (addr, config) = config_from_env()?;
    let bot = EchoBot {
        delay: Duration::from_millis(400),
    };
    let manager = Arc::new(SessionManager::new(bot, ManualRouting, config));

    let app = Router::new()
        .route("/", get(index_handler))
        .merge(create_ws_router(manager))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Copilot Widget</title>
    <style>
        body { margin: 0; padding: 20px; background: #f4f4f6; font-family: system-ui, sans-serif; }
        #chat { max-width: 480px; margin: auto; background: #fff; border-radius: 8px; padding: 12px; }
        #banner { color: #666; font-size: 13px; min-height: 18px; }
        .msg { margin: 6px 0; padding: 8px 10px; border-radius: 6px; }
        .user { background: #dbeafe; text-align: right; }
        .bot { background: #eee; }
        .agent { background: #dcfce7; }
        .pending { color: #999; font-style: italic; }
        .failed { color: #a44; }
    </style>
</head>
<body>
    <div id="chat">
        <div id="banner"></div>
        <div id="session"></div>
        <div id="log"></div>
        <form id="form"><input id="input" autocomplete="off" /> <button>Send</button></form>
        <button id="handoff">Talk to a human</button>
    </div>

    <script>
        const log = document.getElementById('log');
        const banner = document.getElementById('banner');
        const messages = new Map();
        let ws;

        const banners = {
            handoff_requested: 'Connecting you to an agent...',
            agent_served: 'An agent joined the chat',
            closed: 'This conversation has ended',
        };

        function render(msg) {
            let el = messages.get(msg.id);
            if (!el) {
                el = document.createElement('div');
                messages.set(msg.id, el);
                log.appendChild(el);
            }
            el.className = `msg ${msg.author} ${msg.status}`;
            if (msg.status === 'pending') {
                el.textContent = 'typing...';
            } else if (msg.status === 'failed') {
                el.textContent = 'No reply (' + (msg.failure ? msg.failure.type : 'error') + ')';
            } else {
                el.textContent = msg.content.kind === 'text' ? msg.content.value : JSON.stringify(msg.content.value);
            }
        }

        function apply(change) {
            switch (change.type) {
                case 'turn_started': render(change.user); render(change.pending); break;
                case 'input_relayed':
                case 'turn_resolved':
                case 'agent_message': render(change.message); break;
            }
        }

        function connect() {
            const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
            ws = new WebSocket(`${protocol}//${window.location.host}/ws`);
            ws.onmessage = (event) => {
                const msg = JSON.parse(event.data);
                if (msg.type === 'snapshot') {
                    document.getElementById('session').textContent = 'Session ' + msg.view.id;
                    msg.view.transcript.forEach(render);
                    banner.textContent = banners[msg.view.mode] || '';
                } else if (msg.type === 'event') {
                    apply(msg.event.change);
                    banner.textContent = banners[msg.event.mode] || '';
                } else if (msg.type === 'error') {
                    console.warn(msg.message);
                }
            };
        }

        document.getElementById('form').onsubmit = (e) => {
            e.preventDefault();
            const input = document.getElementById('input');
            ws.send(JSON.stringify({ type: 'submit_input', content: { kind: 'text', value: input.value } }));
            input.value = '';
        };
        document.getElementById('handoff').onclick = () => {
            ws.send(JSON.stringify({ type: 'request_handoff', reason: 'user_requested' }));
        };

        connect();
    </script>
</body>
</html>
"#;
