//! Client configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Sizing knobs for the queue, worker
//! pool, and dedup cache are fixed at startup and never resized at runtime.

use std::time::Duration;

use crate::error::StreamError;

/// Top-level streaming client configuration.
///
/// Loaded once at startup via [`StreamConfig::from_env`].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Base URL of the Misskey instance (must be `https`).
    pub instance_url: String,

    /// API access token, carried as the `i` query parameter on the
    /// streaming endpoint. Never logged.
    pub access_token: String,

    /// Capacity of the event queue between the read loop and the workers.
    pub queue_capacity: usize,

    /// How long the read loop waits on a full queue before dropping an
    /// event.
    pub queue_put_timeout: Duration,

    /// Number of worker tasks draining the event queue.
    pub worker_count: usize,

    /// Maximum number of identifiers held by the dedup cache.
    pub dedup_capacity: usize,

    /// Time-to-live of a dedup cache entry.
    pub dedup_ttl: Duration,

    /// Maximum consecutive failed connection attempts before giving up.
    pub ws_max_retries: u32,

    /// Fixed sleep between reconnection attempts.
    pub reconnect_backoff: Duration,

    /// Receive timeout on the socket. A stalled read for longer than this
    /// is tolerated; the loop regains control and continues.
    pub receive_timeout: Duration,

    /// Idle period after which a per-counterpart chat channel is torn down.
    pub chat_channel_idle: Duration,

    /// Base URL of the OpenAI-compatible text-generation API.
    pub llm_api_base: String,

    /// API key for the text-generation service.
    pub llm_api_key: String,

    /// Model name for the text-generation service.
    pub llm_model: String,

    /// Maximum tokens per generated reply.
    pub llm_max_tokens: u32,

    /// Sampling temperature for generated replies.
    pub llm_temperature: f64,
}

impl StreamConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to sensible defaults when a variable is not set.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] if `MISSKEY_INSTANCE_URL`
    /// or `MISSKEY_ACCESS_TOKEN` is missing.
    pub fn from_env() -> Result<Self, StreamError> {
        dotenvy::dotenv().ok();

        let instance_url = std::env::var("MISSKEY_INSTANCE_URL").map_err(|_| {
            StreamError::Configuration("MISSKEY_INSTANCE_URL must be set".to_string())
        })?;
        let access_token = std::env::var("MISSKEY_ACCESS_TOKEN").map_err(|_| {
            StreamError::Configuration("MISSKEY_ACCESS_TOKEN must be set".to_string())
        })?;

        Ok(Self {
            instance_url,
            access_token,
            queue_capacity: parse_env("STREAM_QUEUE_MAX", 1000),
            queue_put_timeout: Duration::from_millis(parse_env(
                "STREAM_QUEUE_PUT_TIMEOUT_MS",
                1000,
            )),
            worker_count: parse_env("STREAM_WORKERS", 4),
            dedup_capacity: parse_env("STREAM_DEDUP_CACHE_MAX", 1000),
            dedup_ttl: Duration::from_secs(parse_env("STREAM_DEDUP_CACHE_TTL_SECS", 600)),
            ws_max_retries: parse_env("WS_MAX_RETRIES", 3),
            reconnect_backoff: Duration::from_secs(parse_env("WS_RECONNECT_BACKOFF_SECS", 3)),
            receive_timeout: Duration::from_secs(parse_env("WS_RECEIVE_TIMEOUT_SECS", 30)),
            chat_channel_idle: Duration::from_secs(parse_env("CHAT_CHANNEL_IDLE_SECS", 300)),
            llm_api_base: std::env::var("LLM_API_BASE")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or_default(),
            llm_model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            llm_max_tokens: parse_env("LLM_MAX_TOKENS", 1000),
            llm_temperature: parse_env("LLM_TEMPERATURE", 0.8),
        })
    }

    /// A configuration with the given instance URL and token and default
    /// sizing knobs; primarily useful for library consumers and tests.
    #[must_use]
    pub fn new(instance_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            instance_url: instance_url.into(),
            access_token: access_token.into(),
            queue_capacity: 1000,
            queue_put_timeout: Duration::from_secs(1),
            worker_count: 4,
            dedup_capacity: 1000,
            dedup_ttl: Duration::from_secs(600),
            ws_max_retries: 3,
            reconnect_backoff: Duration::from_secs(3),
            receive_timeout: Duration::from_secs(30),
            chat_channel_idle: Duration::from_secs(300),
            llm_api_base: "https://api.openai.com/v1".to_string(),
            llm_api_key: String::new(),
            llm_model: "gpt-4o-mini".to_string(),
            llm_max_tokens: 1000,
            llm_temperature: 0.8,
        }
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
