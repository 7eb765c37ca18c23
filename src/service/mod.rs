//! External collaborator interfaces: text generation, the processed-id
//! store, and the plugin hook manager.
//!
//! The streaming core only ever reaches these through the traits defined
//! here; concrete backends live behind the seam.

pub mod plugins;
pub mod store;
pub mod textgen;

pub use plugins::{HookResult, PluginHook, PluginManager};
pub use store::{MemoryStore, ProcessedMeta, ProcessedStore};
pub use textgen::{GenerationOptions, OpenAiGenerator, TextGenerator};
