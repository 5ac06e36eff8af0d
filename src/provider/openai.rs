//! Streaming provider for OpenAI-compatible chat completion APIs.
//!
//! Covers any backend speaking `/v1/chat/completions` with SSE streaming:
//! OpenAI, Gemini's compatibility endpoint, vLLM, llama.cpp server, Groq,
//! Together AI, and friends.

use super::sse::{ChatDelta, ChatStreamDecoder};
use super::Provider;
use crate::error::{RelayError, Result};
use crate::types::Message;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Provider for any OpenAI-compatible API.
///
/// # Example
///
/// ```
/// use llm_relay::provider::OpenAiCompatProvider;
///
/// let provider = OpenAiCompatProvider::new("https://api.example.com")
///     .with_api_key("sk-...");
/// ```
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    temperature: f64,
    max_tokens: u32,
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &self.api_key.as_ref().map(|k| {
                    if k.len() > 6 {
                        format!("{}***", &k[..6])
                    } else {
                        "***".to_string()
                    }
                }),
            )
            .finish()
    }
}

impl OpenAiCompatProvider {
    /// Create a provider without authentication.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 2048,
        }
    }

    /// Set the API key, sent as `Authorization: Bearer {key}`.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the completion token ceiling.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Provide a pre-built HTTP client (connection pool reuse, custom TLS).
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Build the `/v1/chat/completions` request body.
    fn build_body(&self, model: &str, messages: &[Message]) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        json!({
            "model": model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": true,
        })
    }

    /// Parse a `Retry-After` header value as seconds.
    fn parse_retry_after(value: &str) -> Option<Duration> {
        value.trim().parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[Message],
        on_chunk: &mut (dyn FnMut(String) + Send),
    ) -> Result<()> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_body(model, messages);

        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let resp = req.send().await?;
        let status = resp.status();

        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(Self::parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            return Err(RelayError::Http {
                status: status.as_u16(),
                body: text,
                retry_after,
            });
        }

        let mut stream = resp.bytes_stream();
        let mut decoder = ChatStreamDecoder::new();

        'body: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(RelayError::Request)?;
            for delta in decoder.feed(&chunk) {
                match delta {
                    ChatDelta::Token(token) => on_chunk(token),
                    ChatDelta::Finished(_) => break 'body,
                }
            }
        }

        for delta in decoder.finish() {
            if let ChatDelta::Token(token) = delta {
                on_chunk(token);
            }
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "openai-compat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_shape() {
        let provider = OpenAiCompatProvider::new("http://localhost:8000");
        let body = provider.build_body(
            "gemini-1.5-flash",
            &[
                Message::system("Be brief."),
                Message::user("Why is the sky blue?"),
            ],
        );
        assert_eq!(body["model"], "gemini-1.5-flash");
        assert_eq!(body["stream"], true);
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "Why is the sky blue?");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let provider = OpenAiCompatProvider::new("http://localhost:8000/");
        assert_eq!(provider.base_url, "http://localhost:8000");
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(
            OpenAiCompatProvider::parse_retry_after("30"),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            OpenAiCompatProvider::parse_retry_after(" 5 "),
            Some(Duration::from_secs(5))
        );
        assert_eq!(OpenAiCompatProvider::parse_retry_after("soon"), None);
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let provider =
            OpenAiCompatProvider::new("http://localhost").with_api_key("sk-1234567890abcdef");
        let output = format!("{:?}", provider);
        assert!(!output.contains("1234567890abcdef"));
        assert!(output.contains("***"));
    }
}
