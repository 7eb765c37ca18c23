//! Plugin hook manager.
//!
//! Plugins may intercept mentions and chat messages before the registered
//! handlers run; a hook returning `handled: true` short-circuits the rest
//! of the pipeline for that event. Hooks run in registration order and a
//! failing plugin never takes the others down with it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StreamError;

/// Outcome of a plugin hook invocation.
#[derive(Debug, Clone, Default)]
pub struct HookResult {
    /// `true` if the plugin fully handled the event; later plugins and the
    /// registered handlers are skipped.
    pub handled: bool,
    /// Optional reply text produced by the plugin.
    pub response: Option<String>,
}

impl HookResult {
    /// A pass-through result: not handled, no response.
    #[must_use]
    pub fn ignored() -> Self {
        Self::default()
    }

    /// A terminal result with a reply.
    #[must_use]
    pub fn handled_with(response: impl Into<String>) -> Self {
        Self {
            handled: true,
            response: Some(response.into()),
        }
    }
}

/// Hook interface a plugin implements.
#[async_trait]
pub trait PluginHook: Send + Sync {
    /// Plugin name used in logs.
    fn name(&self) -> &str;

    /// Called for every mention before the registered mention handlers.
    async fn on_mention(&self, _payload: &Value) -> Result<HookResult, StreamError> {
        Ok(HookResult::ignored())
    }

    /// Called for every chat message before the registered message
    /// handlers.
    async fn on_message(&self, _payload: &Value) -> Result<HookResult, StreamError> {
        Ok(HookResult::ignored())
    }

    /// Called for every notification. Best-effort; the return value does
    /// not affect dispatch.
    async fn on_notification(&self, _payload: &Value) -> Result<(), StreamError> {
        Ok(())
    }
}

/// Ordered collection of plugin hooks.
#[derive(Default)]
pub struct PluginManager {
    plugins: Vec<Arc<dyn PluginHook>>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

impl PluginManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a plugin. Invocation order is registration order.
    pub fn register(&mut self, plugin: Arc<dyn PluginHook>) {
        self.plugins.push(plugin);
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Returns `true` if no plugins are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Runs every `on_mention` hook in order, collecting results. A plugin
    /// error is logged and skipped; results from the remaining plugins are
    /// still collected.
    pub async fn on_mention(&self, payload: &Value) -> Vec<HookResult> {
        let mut results = Vec::with_capacity(self.plugins.len());
        for plugin in &self.plugins {
            match plugin.on_mention(payload).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    tracing::warn!(plugin = plugin.name(), error = %err, "mention hook failed");
                }
            }
        }
        results
    }

    /// Runs every `on_message` hook in order, collecting results.
    pub async fn on_message(&self, payload: &Value) -> Vec<HookResult> {
        let mut results = Vec::with_capacity(self.plugins.len());
        for plugin in &self.plugins {
            match plugin.on_message(payload).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    tracing::warn!(plugin = plugin.name(), error = %err, "message hook failed");
                }
            }
        }
        results
    }

    /// Runs every `on_notification` hook; failures are logged and the
    /// remaining hooks still run.
    pub async fn on_notification(&self, payload: &Value) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.on_notification(payload).await {
                tracing::warn!(plugin = plugin.name(), error = %err, "notification hook failed");
            }
        }
    }

    /// Returns `true` if any hook result reports the event as handled.
    #[must_use]
    pub fn any_handled(results: &[HookResult]) -> bool {
        results.iter().any(|result| result.handled)
    }
}
