//! Streaming core: connection lifecycle, channel multiplexing,
//! deduplication, and backpressure-aware dispatch.
//!
//! The [`client::StreamingClient`] owns the physical socket and composes
//! the registry, dedup cache, queue, worker pool, dispatcher, and chat
//! channel task registry for the duration of a session.

pub mod chat;
pub mod client;
pub mod dedup;
pub mod dispatch;
pub mod queue;
pub mod registry;
