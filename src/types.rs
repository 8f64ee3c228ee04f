use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl SessionId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug)]
pub enum StudyError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Unsupported media: {0}")]
    UnsupportedMedia(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Upstream timed out: {0}")]
    Timeout(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl StudyError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into(), SpanTrace::capture())
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, msg, code) = match &self.inner {
            StudyError::Validation(m) => (StatusCode::BAD_REQUEST, m.clone(), "VALIDATION_ERROR"),
            StudyError::PayloadTooLarge(m) => {
                (StatusCode::PAYLOAD_TOO_LARGE, m.clone(), "PAYLOAD_TOO_LARGE")
            }
            StudyError::UnsupportedMedia(m) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                m.clone(),
                "UNSUPPORTED_MEDIA",
            ),
            StudyError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone(), "UNAUTHORIZED"),
            StudyError::Forbidden(m) => (StatusCode::FORBIDDEN, m.clone(), "FORBIDDEN"),
            StudyError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone(), "NOT_FOUND"),
            StudyError::Upstream(s, m) => {
                let status = if s.is_client_error() || s.is_server_error() {
                    StatusCode::BAD_GATEWAY
                } else {
                    *s
                };
                (status, m.clone(), "UPSTREAM_ERROR")
            }
            StudyError::Timeout(m) => (StatusCode::GATEWAY_TIMEOUT, m.clone(), "UPSTREAM_TIMEOUT"),
            StudyError::Parse(m) => (StatusCode::BAD_GATEWAY, m.clone(), "PARSE_ERROR"),
            StudyError::Network(e) => (StatusCode::BAD_GATEWAY, e.to_string(), "NETWORK_ERROR"),
            StudyError::Database(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "DATABASE_ERROR",
            ),
            StudyError::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            StudyError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "IO_ERROR"),
            StudyError::Internal(m, _) => {
                (StatusCode::INTERNAL_SERVER_ERROR, m.clone(), "INTERNAL_ERROR")
            }
        };

        if status.is_server_error() {
            tracing::error!("{} ({}): {}\n{}", code, status, msg, self.span_trace);
        } else {
            tracing::warn!("{} ({}): {}", code, status, msg);
        }

        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: StudyError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<StudyError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- CONVERSATION ROLES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "ai")]
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" | "ai" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One prior turn replayed into the prompt, from the store or from a guest transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// A turn of a caller-held guest transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuestMessage {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub id: Option<String>,
}

impl From<GuestMessage> for ChatTurn {
    fn from(m: GuestMessage) -> Self {
        Self {
            role: m.role,
            content: m.content,
        }
    }
}

/// --- PERSISTED RECORDS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub email: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub user_id: Option<UserId>,
    pub topic: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub user_id: Option<UserId>,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
}

impl From<StoredMessage> for ChatTurn {
    fn from(m: StoredMessage) -> Self {
        Self {
            role: m.role,
            content: m.content,
        }
    }
}
