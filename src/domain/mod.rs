//! Domain types: channels, wire frames, and event classification.

pub mod channel;
pub mod event;
pub mod frame;

pub use channel::{ChannelSpec, ChannelType};
pub use event::{EventKind, QueueItem};
pub use frame::{ChannelEvent, Envelope};
