//! Rendering contract.
//!
//! Rendering is strictly downstream of the session: components receive
//! borrowed data, hold no session state and cannot mutate anything.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    handoff::{AgentRef, SessionMode},
    message::{Author, Content, Message, MessageStatus},
    session::SessionView,
};

/// Which component renders a piece of the widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    User,
    Bot,
    Agent,
    Banner,
}

/// A message written by the user.
#[derive(Debug, Clone, Copy)]
pub struct UserMessage<'a> {
    pub message: &'a Message,
}

/// A message written by the bot, with the mode it is shown under.
#[derive(Debug, Clone, Copy)]
pub struct BotMessage<'a> {
    pub message: &'a Message,
    pub mode: SessionMode,
}

/// A message written by a human agent.
#[derive(Debug, Clone, Copy)]
pub struct AgentMessage<'a> {
    pub message: &'a Message,
}

/// Mode banner shown above the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "banner", rename_all = "snake_case")]
pub enum ModeBanner {
    ConnectingToAgent,
    AgentJoined { agent: Option<AgentRef> },
    Closed,
}

impl ModeBanner {
    /// The banner for `mode`; the bot-served mode has none.
    #[must_use]
    pub fn for_mode(mode: SessionMode, agent: Option<&AgentRef>) -> Option<Self> {
        match mode {
            SessionMode::BotServed => None,
            SessionMode::HandoffRequested => Some(Self::ConnectingToAgent),
            SessionMode::AgentServed => Some(Self::AgentJoined {
                agent: agent.cloned(),
            }),
            SessionMode::Closed => Some(Self::Closed),
        }
    }
}

/// Props for one component invocation.
#[derive(Debug, Clone)]
pub enum ComponentProps<'a> {
    User(UserMessage<'a>),
    Bot(BotMessage<'a>),
    Agent(AgentMessage<'a>),
    Banner(ModeBanner),
}

impl<'a> ComponentProps<'a> {
    /// Props for `message` rendered under `mode`.
    #[must_use]
    pub const fn for_message(message: &'a Message, mode: SessionMode) -> Self {
        match message.author {
            Author::User => Self::User(UserMessage { message }),
            Author::Bot => Self::Bot(BotMessage { message, mode }),
            Author::Agent => Self::Agent(AgentMessage { message }),
        }
    }

    #[must_use]
    pub const fn component_type(&self) -> ComponentType {
        match self {
            Self::User(_) => ComponentType::User,
            Self::Bot(_) => ComponentType::Bot,
            Self::Agent(_) => ComponentType::Agent,
            Self::Banner(_) => ComponentType::Banner,
        }
    }
}

/// Something that turns props into a renderable description.
///
/// Implementations must be deterministic: identical props give identical
/// output.
pub trait Component {
    type Output;

    fn render(&self, props: &ComponentProps<'_>) -> Self::Output;
}

/// Serialisable description of one rendered element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderNode {
    pub component: ComponentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    /// Secondary line such as a typing indicator or failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl RenderNode {
    fn message(component: ComponentType, message: &Message) -> Self {
        let (text, data) = match &message.content {
            Content::Text(s) => (Some(s.clone()), None),
            Content::Structured(v) => (None, Some(v.clone())),
        };
        Self {
            component,
            text,
            data,
            status: Some(message.status),
            note: message.failure.as_ref().map(ToString::to_string),
        }
    }
}

/// Default component producing [`RenderNode`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct DescriptionRenderer;

impl Component for DescriptionRenderer {
    type Output = RenderNode;

    fn render(&self, props: &ComponentProps<'_>) -> RenderNode {
        match props {
            ComponentProps::User(UserMessage { message }) => {
                RenderNode::message(ComponentType::User, message)
            }
            ComponentProps::Bot(BotMessage { message, mode }) => {
                let mut node = RenderNode::message(ComponentType::Bot, message);
                if message.status == MessageStatus::Pending {
                    node.text = None;
                    node.note = Some(match mode {
                        SessionMode::BotServed => "typing".to_owned(),
                        _ => "finishing reply".to_owned(),
                    });
                }
                node
            }
            ComponentProps::Agent(AgentMessage { message }) => {
                RenderNode::message(ComponentType::Agent, message)
            }
            ComponentProps::Banner(banner) => RenderNode {
                component: ComponentType::Banner,
                text: Some(banner_text(banner)),
                data: None,
                status: None,
                note: None,
            },
        }
    }
}

fn banner_text(banner: &ModeBanner) -> String {
    match banner {
        ModeBanner::ConnectingToAgent => "Connecting you to an agent".to_owned(),
        ModeBanner::AgentJoined { agent: Some(agent) } => format!("{agent} joined the chat"),
        ModeBanner::AgentJoined { agent: None } => "An agent joined the chat".to_owned(),
        ModeBanner::Closed => "This conversation has ended".to_owned(),
    }
}

/// Render a whole view: the mode banner (if any), then each message in
/// transcript order.
pub fn render_view<C: Component>(view: &SessionView, component: &C) -> Vec<C::Output> {
    let banner = ModeBanner::for_mode(view.mode, view.agent.as_ref())
        .map(|b| component.render(&ComponentProps::Banner(b)));

    banner
        .into_iter()
        .chain(
            view.transcript
                .iter()
                .map(|m| component.render(&ComponentProps::for_message(m, view.mode))),
        )
        .collect()
}
