//! Logical channel names and subscription specs.
//!
//! A channel is a named subscription multiplexed over the single physical
//! WebSocket connection. Well-known names get an enum variant; anything
//! else is carried verbatim as an opaque string channel. That permissive
//! fallback is deliberate: instances ship custom channels and the client
//! should subscribe to them rather than reject the name.

use serde_json::{Map, Value};

/// Well-known streaming channel names, plus an opaque fallback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelType {
    /// Per-account channel carrying mentions, replies, and notifications.
    Main,
    /// Home timeline.
    HomeTimeline,
    /// Local timeline.
    LocalTimeline,
    /// Hybrid (social) timeline.
    HybridTimeline,
    /// Global timeline.
    GlobalTimeline,
    /// Antenna channel (requires an `antennaId` parameter).
    Antenna,
    /// Per-counterpart chat channel (requires an `otherId` parameter).
    ChatUser,
    /// Any channel name not covered above, passed through verbatim.
    Other(String),
}

impl ChannelType {
    /// Parses a channel name. Unknown names become [`ChannelType::Other`].
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "main" => Self::Main,
            "homeTimeline" => Self::HomeTimeline,
            "localTimeline" => Self::LocalTimeline,
            "hybridTimeline" => Self::HybridTimeline,
            "globalTimeline" => Self::GlobalTimeline,
            "antenna" => Self::Antenna,
            "chatUser" => Self::ChatUser,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns the wire name of this channel.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Main => "main",
            Self::HomeTimeline => "homeTimeline",
            Self::LocalTimeline => "localTimeline",
            Self::HybridTimeline => "hybridTimeline",
            Self::GlobalTimeline => "globalTimeline",
            Self::Antenna => "antenna",
            Self::ChatUser => "chatUser",
            Self::Other(name) => name,
        }
    }

    /// Returns `true` if this is one of the timeline channels whose
    /// payloads route to the note handler path.
    #[must_use]
    pub const fn is_timeline(&self) -> bool {
        matches!(
            self,
            Self::HomeTimeline | Self::LocalTimeline | Self::HybridTimeline | Self::GlobalTimeline
        )
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested channel subscription: a name plus opaque parameters.
///
/// Two specs are equal when their names match and their parameter maps
/// hold the same entries, regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Channel name.
    pub name: ChannelType,
    /// Opaque key/value parameters sent with the subscribe frame.
    pub params: Map<String, Value>,
}

impl ChannelSpec {
    /// A spec with no parameters.
    #[must_use]
    pub fn new(name: ChannelType) -> Self {
        Self {
            name,
            params: Map::new(),
        }
    }

    /// A spec with parameters.
    #[must_use]
    pub fn with_params(name: ChannelType, params: Map<String, Value>) -> Self {
        Self { name, params }
    }

    /// Returns `true` if the name is empty (a spec that should be dropped
    /// during normalization).
    #[must_use]
    pub fn is_empty_name(&self) -> bool {
        self.name.as_str().is_empty()
    }
}

impl From<&str> for ChannelSpec {
    fn from(name: &str) -> Self {
        Self::new(ChannelType::parse(name))
    }
}
