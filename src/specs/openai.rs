use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// --- OPENROUTER (OPENAI-COMPATIBLE) CHAT SCHEMA ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum OpenAiMessage {
    System { content: String },
    User { content: OpenAiContent },
    Assistant { content: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OpenAiContent {
    String(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpenAiContentPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenAiImageUrl {
    pub url: String,
}

/// --- PROVIDER WIRE TYPES (RESPONSES) ---

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderPulse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ProviderPulseChoice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderPulseChoice {
    #[serde(default)]
    pub delta: PulseDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PulseDelta {
    #[serde(default)]
    pub content: Option<crate::model::ModelContent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCompletion {
    #[serde(default)]
    pub choices: Vec<ProviderCompletionChoice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCompletionChoice {
    pub message: ProviderCompletionMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCompletionMessage {
    #[serde(default)]
    pub content: Option<crate::model::ModelContent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct ProviderError {
    pub error: ProviderErrorDetails,
}

#[derive(Debug, Deserialize)]
pub struct ProviderErrorDetails {
    pub message: String,
    pub code: Option<serde_json::Value>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug)]
pub enum LineEvent {
    Pulse(ProviderPulse),
    Error(ProviderError),
    Unknown(String),
}

pub fn parse_provider_line(data: &str) -> LineEvent {
    // Error first: it is the more specific shape
    if let Ok(err) = serde_json::from_str::<ProviderError>(data) {
        return LineEvent::Error(err);
    }
    if let Ok(pulse) = serde_json::from_str::<ProviderPulse>(data) {
        if !pulse.choices.is_empty() || pulse.usage.is_some() {
            return LineEvent::Pulse(pulse);
        }
    }
    tracing::debug!(
        "[STREAM] Unknown line format: {}",
        crate::str_utils::prefix_chars(data, 200)
    );
    LineEvent::Unknown(data.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provider_pulse() {
        let json = r#"{"id":"123","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hello"}}],"usage":null}"#;
        match parse_provider_line(json) {
            LineEvent::Pulse(p) => {
                assert_eq!(p.id, "123");
                assert!(p.choices[0].delta.content.is_some());
            }
            other => panic!("Expected Pulse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_usage_only_pulse() {
        let json = r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        match parse_provider_line(json) {
            LineEvent::Pulse(p) => assert!(p.usage.is_some()),
            other => panic!("Expected Pulse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_provider_error() {
        let json = r#"{"error":{"message":"Rate limited","code":429}}"#;
        match parse_provider_line(json) {
            LineEvent::Error(e) => assert_eq!(e.error.message, "Rate limited"),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_image_part_wire_shape() {
        let msg = OpenAiMessage::User {
            content: OpenAiContent::Parts(vec![
                OpenAiContentPart::Text { text: "What is this?".into() },
                OpenAiContentPart::ImageUrl {
                    image_url: OpenAiImageUrl { url: "data:image/png;base64,AAAA".into() },
                },
            ]),
        };
        let value = match serde_json::to_value(&msg) {
            Ok(v) => v,
            Err(e) => panic!("serialize failed: {:?}", e),
        };
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"][1]["type"], "image_url");
        assert_eq!(value["content"][1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }
}
