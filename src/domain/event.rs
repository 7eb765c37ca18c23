//! Logical event classification and queue items.

use serde_json::Value;

/// Logical event kinds routed by the dispatcher.
///
/// The wire carries several spellings for chat messages; all of them
/// classify as [`EventKind::Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A note mentioning or replying to the account.
    Mention,
    /// A direct chat message.
    Message,
    /// A timeline or antenna note.
    Note,
    /// A notification (best-effort handling, no reply expected).
    Notification,
}

impl EventKind {
    /// Classifies an inner channel event type.
    ///
    /// Returns `None` for event types the dispatcher does not route
    /// (e.g. `readAllNotifications`, typing indicators).
    #[must_use]
    pub fn classify(event_type: &str) -> Option<Self> {
        match event_type {
            "mention" | "reply" => Some(Self::Mention),
            "messagingMessage" | "messaging_message" | "message" | "chat" => Some(Self::Message),
            "note" => Some(Self::Note),
            "notification" => Some(Self::Notification),
            _ => None,
        }
    }

    /// Stable name used in logs and handler-table keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mention => "mention",
            Self::Message => "message",
            Self::Note => "note",
            Self::Notification => "notification",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item passed from the read loop to the worker pool.
#[derive(Debug, Clone)]
pub enum QueueItem {
    /// A decoded channel event awaiting dispatch.
    Event {
        /// Inner event type as carried on the wire.
        event_type: String,
        /// Event payload.
        payload: Value,
    },
    /// Terminal sentinel: the receiving worker must exit.
    Shutdown,
}

/// Extracts the identifier used for deduplication from an event payload.
///
/// Mentions, notes, chat messages, and notifications all carry a top-level
/// `id` field.
#[must_use]
pub fn payload_id(payload: &Value) -> Option<&str> {
    payload.get("id").and_then(Value::as_str)
}
