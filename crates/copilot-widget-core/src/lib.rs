//! Conversation state and handoff orchestration for the copilot widget.
//!
//! This crate holds the runtime-free building blocks:
//! - `MessageStore` - Append-only transcript
//! - `TurnCoordinator` - Single-flight user/bot turns
//! - `HandoffController` - Bot-to-agent handoff state machine
//! - `Session` - The three above behind one atomic interface
//! - `component` - Rendering contract
//! - `BotService` and `AgentRouter` collaborator traits

pub mod component;
pub mod context;
pub mod error;
pub mod handoff;
pub mod message;
pub mod msg_store;
pub mod session;
pub mod traits;
pub mod turn;

pub use component::{
    AgentMessage, BotMessage, Component, ComponentProps, ComponentType, DescriptionRenderer,
    ModeBanner, RenderNode, UserMessage, render_view,
};
pub use context::SessionMetadata;
pub use error::{AuthorMismatch, SessionError, StoreError};
pub use handoff::{
    AgentRef, HandoffController, HandoffId, HandoffPayload, HandoffPayloadType, HandoffReason,
    ModeChange, SessionMode,
};
pub use message::{
    Author, BotMessageType, Content, Message, MessageId, MessageStatus, TurnFailure,
    UserMessageType,
};
pub use msg_store::MessageStore;
pub use session::{Applied, Session, SessionId, SessionView, StateChange, Submission};
pub use traits::{
    AgentRouter, BotReply, BotService, ManualRouting, RoutingDecision, RoutingError,
    ServiceError,
};
pub use turn::{TurnCoordinator, TurnResult, TurnStart};
