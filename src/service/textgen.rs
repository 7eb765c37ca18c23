//! Text-generation collaborator.
//!
//! [`TextGenerator`] is the narrow interface the dispatch layer consumes;
//! [`OpenAiGenerator`] is a thin adapter for OpenAI-compatible
//! chat-completions endpoints. The adapter maps HTTP failure classes onto
//! the collaborator error taxonomy so callers can distinguish
//! connectivity, auth, and rate-limit conditions.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::StreamConfig;
use crate::error::StreamError;

/// Per-call generation options.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    /// Maximum tokens in the generated reply.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: 0.8,
        }
    }
}

/// Narrow interface to the reply-generation service.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generates reply text for `prompt` under `system_prompt`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Api`] with a connectivity, auth, or
    /// rate-limit kind.
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, StreamError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Adapter for OpenAI-compatible chat-completions APIs.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl OpenAiGenerator {
    /// Builds an adapter from configuration.
    #[must_use]
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.llm_api_base.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, StreamError> {
        let mut messages = Vec::with_capacity(2);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        let request = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| StreamError::generation_unreachable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(StreamError::generation_auth(format!(
                "server returned {status}"
            )));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(StreamError::generation_rate_limited(retry_after));
        }
        if !status.is_success() {
            return Err(StreamError::generation_unreachable(format!(
                "server returned {status}"
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| StreamError::generation_unreachable(format!("bad response body: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| StreamError::generation_unreachable("empty completion".to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::error::{ApiErrorKind, ApiService};

    #[test]
    fn request_body_shape() {
        let request = ChatRequest {
            model: "test-model",
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "be brief",
                },
                ChatMessage {
                    role: "user",
                    content: "hello",
                },
            ],
            max_tokens: 64,
            temperature: 0.5,
        };
        let Ok(value) = serde_json::to_value(&request) else {
            panic!("request serialization failed");
        };
        assert_eq!(value["model"], "test-model");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hello");
        assert_eq!(value["max_tokens"], 64);
    }

    #[test]
    fn response_body_parses_content() {
        let text = r#"{"choices":[{"message":{"role":"assistant","content":" hi there "}}]}"#;
        let Ok(body) = serde_json::from_str::<ChatResponse>(text) else {
            panic!("response parse failed");
        };
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content);
        assert_eq!(content.as_deref(), Some(" hi there "));
    }

    #[test]
    fn error_shorthands_carry_service() {
        let err = StreamError::generation_auth("401");
        let StreamError::Api { service, kind, .. } = err else {
            panic!("expected api error");
        };
        assert_eq!(service, ApiService::TextGeneration);
        assert_eq!(kind, ApiErrorKind::Auth);
    }
}
