//! Boundary to the hosted language model.
//!
//! Handlers and the stream orchestrator only see `ChatModel`; the OpenRouter client is built
//! once at startup and injected through `AppState`.

use crate::constants::OPENROUTER_CHAT_COMPLETIONS;
use crate::hardening::{CircuitBreaker, RetryPolicy};
use crate::specs::openai::{
    parse_provider_line, LineEvent, OpenAiMessage, OpenAiRequest, ProviderCompletion,
};
use crate::types::{Result, StudyError};
use async_trait::async_trait;
use futures_util::{future, Stream, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON object response.
    pub json_mode: bool,
}

impl ModelRequest {
    pub fn new(model: impl Into<String>, messages: Vec<OpenAiMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            json_mode: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_json_mode(mut self) -> Self {
        self.json_mode = true;
        self
    }

    fn to_wire(&self, stream: bool) -> OpenAiRequest {
        OpenAiRequest {
            model: self.model.clone(),
            messages: self.messages.clone(),
            stream: Some(stream),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format: if self.json_mode {
                Some(serde_json::json!({ "type": "json_object" }))
            } else {
                None
            },
            extra: HashMap::new(),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Starts a completion and yields text fragments as the provider produces them.
    async fn stream_chat(&self, request: ModelRequest) -> Result<TokenStream>;

    /// Runs a completion to the end and returns its text.
    async fn complete(&self, request: ModelRequest) -> Result<String>;
}

/// Every shape the provider uses for message content.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ModelContent {
    Text(String),
    Parts(Vec<ContentPart>),
    Object(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ContentPart {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Flattens any provider content shape into plain text.
pub fn to_plain_text(content: &ModelContent) -> String {
    match content {
        ModelContent::Text(s) => s.clone(),
        ModelContent::Parts(parts) => parts
            .iter()
            .filter(|p| matches!(p.kind.as_deref(), None | Some("text") | Some("output_text")))
            .filter_map(|p| p.text.as_deref())
            .collect(),
        ModelContent::Object(value) => value_text(value),
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items.iter().map(value_text).collect(),
        serde_json::Value::Object(map) => match map.get("text").or_else(|| map.get("content")) {
            Some(inner) => value_text(inner),
            None => String::new(),
        },
        _ => String::new(),
    }
}

enum SseLine {
    Skip,
    Done,
    Fragment(String),
    Failed(crate::types::ObservedError),
}

fn classify_line(line: std::result::Result<String, tokio_util::codec::LinesCodecError>) -> SseLine {
    let line = match line {
        Ok(l) => l,
        Err(tokio_util::codec::LinesCodecError::Io(e)) => return SseLine::Failed(e.into()),
        Err(e) => return SseLine::Failed(StudyError::Parse(e.to_string()).into()),
    };

    let data = match line.strip_prefix("data:") {
        Some(d) => d.trim_start(),
        // Comments (": OPENROUTER PROCESSING"), event names and blank separators
        None => return SseLine::Skip,
    };

    if data == "[DONE]" {
        tracing::debug!("[☁️  -> ⚙️ ] Stream end marker [DONE] received");
        return SseLine::Done;
    }

    match parse_provider_line(data) {
        LineEvent::Pulse(pulse) => {
            let text: String = pulse
                .choices
                .iter()
                .filter_map(|c| c.delta.content.as_ref())
                .map(to_plain_text)
                .collect();
            if text.is_empty() {
                SseLine::Skip
            } else {
                SseLine::Fragment(text)
            }
        }
        LineEvent::Error(err) => {
            tracing::error!("[☁️  -> ⚙️ ] Provider error mid-stream: {}", err.error.message);
            SseLine::Failed(
                StudyError::Upstream(axum::http::StatusCode::BAD_GATEWAY, err.error.message).into(),
            )
        }
        LineEvent::Unknown(_) => SseLine::Skip,
    }
}

pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    retry: RetryPolicy,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl OpenRouterClient {
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        max_retries: u32,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            endpoint: OPENROUTER_CHAT_COMPLETIONS.to_string(),
            retry: RetryPolicy::new(max_retries, 100),
            circuit_breaker,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn execute(&self, body: &OpenAiRequest) -> Result<reqwest::Response> {
        self.circuit_breaker.check().await?;

        let result = self
            .retry
            .execute_with_retry(|| async move {
                let response = self
                    .http
                    .post(&self.endpoint)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .json(body)
                    .send()
                    .await
                    .map_err(StudyError::Network)?;

                let status = response.status();
                if status.is_success() {
                    Ok(response)
                } else {
                    let error_body = match response.text().await {
                        Ok(text) => text,
                        Err(_) => "Unknown error".to_string(),
                    };
                    Err(StudyError::Upstream(status, error_body).into())
                }
            })
            .await;

        match &result {
            Ok(_) => self.circuit_breaker.record_success().await,
            Err(e) if RetryPolicy::is_retryable(e) => self.circuit_breaker.record_failure().await,
            Err(_) => {}
        }
        result
    }
}

#[async_trait]
impl ChatModel for OpenRouterClient {
    async fn stream_chat(&self, request: ModelRequest) -> Result<TokenStream> {
        let body = request.to_wire(true);
        tracing::info!(
            "[⚙️  -> ☁️ ] Streaming request: model={} messages={}",
            body.model,
            body.messages.len()
        );
        let response = self.execute(&body).await?;
        tracing::info!("[☁️  -> ⚙️ ] Status: {}", response.status());

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let lines = FramedRead::new(
            StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(1024 * 1024),
        );

        let fragments = lines
            .map(classify_line)
            .take_while(|line| future::ready(!matches!(line, SseLine::Done)))
            .filter_map(|line| {
                future::ready(match line {
                    SseLine::Fragment(text) => Some(Ok(text)),
                    SseLine::Failed(e) => Some(Err(e)),
                    SseLine::Skip | SseLine::Done => None,
                })
            });

        Ok(Box::pin(fragments))
    }

    async fn complete(&self, request: ModelRequest) -> Result<String> {
        let body = request.to_wire(false);
        tracing::info!(
            "[⚙️  -> ☁️ ] Completion request: model={} messages={}",
            body.model,
            body.messages.len()
        );
        let response = self.execute(&body).await?;
        let completion: ProviderCompletion = response.json().await?;

        if let Some(usage) = &completion.usage {
            tracing::debug!(
                "Completion tokens: prompt={} completion={} total={}",
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens
            );
        }

        let choice = match completion.choices.first() {
            Some(c) => c,
            None => {
                return Err(StudyError::Parse("Model returned no choices".to_string()).into())
            }
        };
        if let Some(reason) = &choice.finish_reason {
            tracing::debug!("Completion finish_reason: {}", reason);
        }

        Ok(match &choice.message.content {
            Some(content) => to_plain_text(content),
            None => String::new(),
        })
    }
}
