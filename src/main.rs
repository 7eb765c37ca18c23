//! misskey-stream entry point.
//!
//! Connects to the configured instance, generates replies to mentions via
//! the text-generation service, and shuts down cleanly on Ctrl-C.
//!
//! Posting the generated reply back to the instance requires the HTTP
//! API, which this crate does not wrap; the binary logs the reply text
//! and marks the mention handled.

use std::sync::Arc;

use serde_json::Value;
use tracing_subscriber::EnvFilter;

use misskey_stream::config::StreamConfig;
use misskey_stream::service::{
    GenerationOptions, MemoryStore, OpenAiGenerator, PluginManager, TextGenerator,
};
use misskey_stream::stream::client::StreamingClient;

const SYSTEM_PROMPT: &str = "You are a friendly fediverse bot. Reply briefly and in kind.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = StreamConfig::from_env()?;
    tracing::info!(instance = %config.instance_url, "starting misskey-stream");

    let generator = Arc::new(OpenAiGenerator::new(&config));
    let options = GenerationOptions {
        max_tokens: config.llm_max_tokens,
        temperature: config.llm_temperature,
    };

    let store = Arc::new(MemoryStore::new());
    let plugins = Arc::new(PluginManager::new());
    let client = Arc::new(StreamingClient::new(config, store, plugins));

    let mention_generator = Arc::clone(&generator);
    client
        .on_mention(Arc::new(move |payload: Value| {
            let generator = Arc::clone(&mention_generator);
            let options = options.clone();
            Box::pin(async move {
                let Some(text) = payload.get("text").and_then(Value::as_str) else {
                    return Ok(false);
                };
                let reply = generator.generate(text, SYSTEM_PROMPT, &options).await?;
                let note_id = payload.get("id").and_then(Value::as_str).unwrap_or("");
                // Posting the reply needs the HTTP API; log it instead.
                tracing::info!(note = note_id, reply = %reply, "generated mention reply");
                Ok(true)
            })
        }))
        .await;

    // Run the streaming session until it fails permanently or a shutdown
    // signal arrives
    let runner = Arc::clone(&client);
    let mut session = tokio::spawn(async move { runner.connect(&[], true).await });

    tokio::select! {
        result = &mut session => {
            client.close().await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err.into()),
                Err(err) => return Err(err.into()),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            client.close().await;
            match session.await {
                Ok(Ok(())) | Err(_) => {}
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "streaming session ended with error");
                }
            }
        }
    }

    Ok(())
}
