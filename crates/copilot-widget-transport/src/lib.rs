//! Transport layer for browser-hosted widgets.
//!
//! Provides:
//! - Wire protocol (internally tagged JSON)
//! - WebSocket transport (feature: websocket)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use protocol::{ClientMessage, ClientRole, ServerMessage, TransportError, events_after};
