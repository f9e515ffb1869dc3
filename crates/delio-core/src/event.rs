use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Origin of an inbound event.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    Voice,
    Image,
    Heartbeat,
    Reminder,
    Manual,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Voice => "voice",
            Self::Image => "image",
            Self::Heartbeat => "heartbeat",
            Self::Reminder => "reminder",
            Self::Manual => "manual",
        }
    }

    /// Timer-driven events carry no user-authored text.
    pub fn is_background(self) -> bool {
        matches!(self, Self::Heartbeat | Self::Reminder)
    }
}

/// Routing hint set by the event producer.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Skip memory retrieval and go straight to planning.
    Simple,
    #[default]
    Complex,
    /// Route through extended reasoning after retrieval.
    DeepThink,
}

/// One unit of kernel ingress: an inbound message, a timer tick, or an operator command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KernelEvent {
    pub user_id: UserId,
    pub event_type: EventType,
    #[serde(default)]
    pub raw_input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl KernelEvent {
    pub fn new(
        user_id: impl Into<UserId>,
        event_type: EventType,
        raw_input: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            event_type,
            raw_input: raw_input.into(),
            intent: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn message(user_id: impl Into<UserId>, raw_input: impl Into<String>) -> Self {
        Self::new(user_id, EventType::Message, raw_input)
    }

    pub fn heartbeat(user_id: impl Into<UserId>) -> Self {
        Self::new(user_id, EventType::Heartbeat, "")
    }

    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
