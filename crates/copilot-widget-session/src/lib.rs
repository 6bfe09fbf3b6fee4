//! Async session orchestration for the copilot widget.
//!
//! Provides:
//! - `SessionContext` - One task per session, serialised intents, notifications
//! - `SessionManager` - Mount and unmount independent sessions
//! - `SessionConfig` - Queue sizes and reply timeout

pub mod config;
pub mod context;
pub mod manager;

pub use config::SessionConfig;
pub use context::{HandoffHandle, HandoffOutcome, SessionContext, SessionEvent, TurnHandle};
pub use manager::{ManagerError, SessionManager};
