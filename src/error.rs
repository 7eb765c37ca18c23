//! Error types for the streaming subsystem.
//!
//! [`StreamError`] is the central error type. Each variant maps to one
//! recovery strategy: configuration errors fail fast, connection errors are
//! retried up to a bound, reconnect signals restart the read loop, and
//! decode errors are recovered locally by skipping the offending message.

use std::time::Duration;

/// Which external collaborator an [`StreamError::Api`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiService {
    /// The text-generation service.
    TextGeneration,
    /// The processed-identifier store.
    Store,
}

impl std::fmt::Display for ApiService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TextGeneration => write!(f, "text-generation"),
            Self::Store => write!(f, "store"),
        }
    }
}

/// Failure mode of a collaborator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// The service could not be reached or returned a transport error.
    Connectivity,
    /// Credentials were rejected.
    Auth,
    /// The service asked the client to back off.
    RateLimited {
        /// Suggested wait before retrying, when the service provided one.
        retry_after: Option<Duration>,
    },
}

impl std::fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connectivity => write!(f, "connectivity failure"),
            Self::Auth => write!(f, "authentication failure"),
            Self::RateLimited {
                retry_after: Some(d),
            } => write!(f, "rate limited; retry after {} s", d.as_secs()),
            Self::RateLimited { retry_after: None } => write!(f, "rate limited"),
        }
    }
}

/// Error enum for the streaming client and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Invalid configuration (e.g. insecure instance URL scheme).
    /// Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Initial socket or handshake failure. Retried by the outer
    /// reconnect loop up to the configured bound, then fatal.
    #[error("websocket connection failed: {0}")]
    Connection(String),

    /// Mid-session transport or protocol failure detected inside the read
    /// loop. Always triggers a fresh connect attempt, subject to the same
    /// retry bound.
    #[error("websocket connection lost: {0}")]
    Reconnect(String),

    /// A single malformed message. Logged and skipped; the read loop
    /// continues.
    #[error("failed to decode message: {0}")]
    Decode(String),

    /// A collaborator call failed.
    #[error("{service} API error: {kind}: {message}")]
    Api {
        /// Which collaborator failed.
        service: ApiService,
        /// Failure mode.
        kind: ApiErrorKind,
        /// Human-readable detail.
        message: String,
    },
}

impl StreamError {
    /// Returns `true` if the outer connect loop should retry after this
    /// error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Reconnect(_))
    }

    /// Shorthand for a text-generation connectivity failure.
    #[must_use]
    pub fn generation_unreachable(message: impl Into<String>) -> Self {
        Self::Api {
            service: ApiService::TextGeneration,
            kind: ApiErrorKind::Connectivity,
            message: message.into(),
        }
    }

    /// Shorthand for a text-generation authentication failure.
    #[must_use]
    pub fn generation_auth(message: impl Into<String>) -> Self {
        Self::Api {
            service: ApiService::TextGeneration,
            kind: ApiErrorKind::Auth,
            message: message.into(),
        }
    }

    /// Shorthand for a text-generation rate-limit response.
    #[must_use]
    pub fn generation_rate_limited(retry_after: Option<Duration>) -> Self {
        Self::Api {
            service: ApiService::TextGeneration,
            kind: ApiErrorKind::RateLimited { retry_after },
            message: "too many requests".to_string(),
        }
    }
}
