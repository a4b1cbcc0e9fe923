//! Chat events: immutable notifications flowing through the dispatcher.
//!
//! Platform extensions publish events for inbound activity. Triggers subscribe
//! per [`EventKind`] and decide whether an action should run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::entity::{Chat, ChatId, Message, MessageContent, MessageId, UserId};

/// The routing key used by subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageReceived,
    MessageSent,
    MessageDeleted,
    UserJoined,
    UserLeft,
    ChatAdded,
    /// Published once after every extension has started
    Ready,
    /// Published when the runtime begins shutting down
    Shutdown,
    /// Extension-defined kinds
    Custom(String),
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageReceived => f.write_str("message_received"),
            Self::MessageSent => f.write_str("message_sent"),
            Self::MessageDeleted => f.write_str("message_deleted"),
            Self::UserJoined => f.write_str("user_joined"),
            Self::UserLeft => f.write_str("user_left"),
            Self::ChatAdded => f.write_str("chat_added"),
            Self::Ready => f.write_str("ready"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::Custom(kind) => write!(f, "custom:{kind}"),
        }
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A message was recorded from a platform
    MessageReceived { message: Message },

    /// Outbound content for a chat, consumed by the owning platform
    MessageSent {
        chat: ChatId,
        content: MessageContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
    },

    MessageDeleted { chat: ChatId, message: MessageId },

    UserJoined { chat: ChatId, user: UserId },

    UserLeft { chat: ChatId, user: UserId },

    ChatAdded { chat: Chat },

    Ready,

    Shutdown,

    Custom { kind: String, data: Value },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived { .. } => EventKind::MessageReceived,
            Self::MessageSent { .. } => EventKind::MessageSent,
            Self::MessageDeleted { .. } => EventKind::MessageDeleted,
            Self::UserJoined { .. } => EventKind::UserJoined,
            Self::UserLeft { .. } => EventKind::UserLeft,
            Self::ChatAdded { .. } => EventKind::ChatAdded,
            Self::Ready => EventKind::Ready,
            Self::Shutdown => EventKind::Shutdown,
            Self::Custom { kind, .. } => EventKind::Custom(kind.clone()),
        }
    }
}

/// An event plus its envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID
    pub id: String,

    /// The producing connection; delivery is FIFO per source
    pub source: String,

    pub timestamp: DateTime<Utc>,

    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// The message carried by a `MessageReceived` event.
    pub fn message(&self) -> Option<&Message> {
        match &self.payload {
            EventPayload::MessageReceived { message } => Some(message),
            _ => None,
        }
    }

    /// The chat this event concerns, if any.
    pub fn chat_id(&self) -> Option<&ChatId> {
        match &self.payload {
            EventPayload::MessageReceived { message } => Some(&message.chat),
            EventPayload::MessageSent { chat, .. }
            | EventPayload::MessageDeleted { chat, .. }
            | EventPayload::UserJoined { chat, .. }
            | EventPayload::UserLeft { chat, .. } => Some(chat),
            EventPayload::ChatAdded { chat } => Some(&chat.id),
            EventPayload::Ready | EventPayload::Shutdown | EventPayload::Custom { .. } => None,
        }
    }
}
