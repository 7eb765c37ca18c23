//! Wire frames for the streaming protocol.
//!
//! All frames are JSON text frames with an outer `{"type": ..., "body": ...}`
//! shape. Outbound frames are built by [`ClientFrame`] constructors; the
//! inbound direction is decoded leniently into [`Envelope`] so that a
//! structurally odd message can be logged and skipped without failing the
//! read loop.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Client → server frame.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", content = "body", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Subscribe to a logical channel.
    Connect(ConnectBody),
    /// Unsubscribe from a logical channel.
    Disconnect(DisconnectBody),
    /// Channel-scoped message.
    Ch(ChannelMessageBody),
}

/// Body of a subscribe frame.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConnectBody {
    /// Channel name.
    pub channel: String,
    /// Client-generated subscription identifier.
    pub id: String,
    /// Opaque channel parameters.
    pub params: Map<String, Value>,
}

/// Body of an unsubscribe frame.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DisconnectBody {
    /// Subscription identifier to tear down.
    pub id: String,
}

/// Body of a channel-scoped message frame.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChannelMessageBody {
    /// Subscription identifier the message is scoped to.
    pub id: String,
    /// Event type within the channel.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque message body.
    pub body: Map<String, Value>,
}

impl ClientFrame {
    /// Builds a subscribe frame.
    #[must_use]
    pub fn connect(channel: impl Into<String>, id: impl Into<String>, params: Map<String, Value>) -> Self {
        Self::Connect(ConnectBody {
            channel: channel.into(),
            id: id.into(),
            params,
        })
    }

    /// Builds an unsubscribe frame.
    #[must_use]
    pub fn disconnect(id: impl Into<String>) -> Self {
        Self::Disconnect(DisconnectBody { id: id.into() })
    }

    /// Builds a channel-scoped message frame.
    #[must_use]
    pub fn channel_message(
        id: impl Into<String>,
        event_type: impl Into<String>,
        body: Map<String, Value>,
    ) -> Self {
        Self::Ch(ChannelMessageBody {
            id: id.into(),
            event_type: event_type.into(),
            body,
        })
    }

    /// Serializes the frame to its JSON text representation.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` if serialization fails (cannot happen
    /// for these value-only types in practice).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Inbound message envelope.
///
/// Only `type == "channel"` envelopes are dispatched further; every other
/// type is logged and discarded.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    /// Top-level message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Variant-specific body.
    #[serde(default)]
    pub body: Value,
}

impl Envelope {
    /// Returns `true` for channel-scoped envelopes.
    #[must_use]
    pub fn is_channel(&self) -> bool {
        self.kind == "channel"
    }
}

/// Channel-scoped inbound message, carried in a channel [`Envelope`] body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEvent {
    /// Subscription identifier this event belongs to.
    #[serde(default)]
    pub id: Option<String>,
    /// Inner event type (`mention`, `note`, `notification`, chat variants).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    #[serde(default)]
    pub body: Value,
}
