use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One parsed notification from a webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Local receive time of the delivery this event came from.
    #[serde(rename = "timestamp")]
    pub received_at: DateTime<Utc>,
    /// Platform-supplied `entry.time`, when present.
    #[serde(rename = "entry_time")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    DirectMessage(DirectMessage),
    Comment(Comment),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    DirectMessage,
    Comment,
}

impl WebhookEvent {
    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::DirectMessage(_) => EventKind::DirectMessage,
            EventPayload::Comment(_) => EventKind::Comment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub sender_id: Option<String>,
    pub recipient_id: Option<String>,
    pub text: Option<String>,
    pub message_id: Option<String>,
    #[serde(default)]
    pub is_echo: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub comment_id: Option<String>,
    pub text: Option<String>,
    pub media_id: Option<String>,
    pub media_type: Option<String>,
    pub from_id: Option<String>,
    pub from_username: Option<String>,
}

/// Groups direct messages exchanged between the same two accounts,
/// regardless of which side sent them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn between(a: &str, b: &str) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{lo}_{hi}"))
    }

    pub fn for_message(message: &DirectMessage) -> Option<Self> {
        let sender = message.sender_id.as_deref()?;
        let recipient = message.recipient_id.as_deref()?;
        Some(Self::between(sender, recipient))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A verified webhook delivery as it is kept in the event log: the verbatim
/// provider payload plus whatever sub-events were parsed out of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub parsed_events: Vec<WebhookEvent>,
}
