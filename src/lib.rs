//! # misskey-stream
//!
//! Long-lived streaming client for Misskey-compatible instances.
//!
//! The client keeps one WebSocket connection to the instance's
//! `/streaming` endpoint and multiplexes logical channel subscriptions
//! over it. Inbound events pass through a dedup cache, a bounded queue,
//! and a fixed worker pool before reaching the dispatcher, which routes
//! them to plugin hooks and registered handlers.
//!
//! ## Architecture
//!
//! ```text
//! Misskey instance (wss)
//!     │
//!     └── StreamingClient (stream/client)
//!             ├── ChannelRegistry (stream/registry)
//!             ├── DedupCache (stream/dedup)
//!             ├── EventQueue + WorkerPool (stream/queue)
//!             ├── ChatChannelTasks (stream/chat)
//!             └── Dispatcher (stream/dispatch)
//!                     ├── PluginManager (service/plugins)
//!                     ├── ProcessedStore (service/store)
//!                     └── TextGenerator (service/textgen)
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod service;
pub mod stream;
