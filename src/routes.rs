use crate::constants::FRAME_CHANNEL_CAPACITY;
use crate::db;
use crate::frames::FrameSink;
use crate::generate::{GenerateRequest, MindmapNode};
use crate::health;
use crate::intent::{RequestIntent, AUTH_USER_HEADER};
use crate::logging::{request_id, request_id_middleware};
use crate::ndjson::{self, NdjsonBody};
use crate::types::{Result, StudyError, StoredMessage, UserId};
use crate::AppState;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::Instrument;

pub const CHAT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
const NDJSON_CHANNEL_CAPACITY: usize = 16;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/sessions/:id/messages", get(session_messages))
        .route("/api/flashcards", post(flashcards))
        .route("/api/quiz", post(quiz))
        .route("/api/mindmap", post(mindmap))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(DefaultBodyLimit::max(state.args.max_body_size))
        .layer(cors_layer(state.args.cors_origins.as_deref()))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_headers(Any)
            .allow_methods(Any)
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_headers(Any)
            .allow_methods(Any)
    }
}

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(StudyError::Validation(rejection.body_text()).into()),
    }
}

/// POST /api/chat. Failures before the first byte are HTTP statuses; after it, frames.
async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    intent: RequestIntent,
) -> Result<Response> {
    let request_id = request_id(&headers);
    tracing::info!(
        "Chat request: session={} guest={} operation={:?} attachment={}",
        intent.session_id.short(),
        intent.is_guest(),
        intent.operation,
        intent.attachment.kind()
    );

    let prepared = state.pipeline.prepare(intent, &request_id).await?;

    let (sink, body) = FrameSink::channel(FRAME_CHANNEL_CAPACITY);
    let pipeline = state.pipeline.clone();
    tokio::spawn(
        async move {
            pipeline.run(prepared, sink).await;
        }
        .in_current_span(),
    );

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(CHAT_CONTENT_TYPE)),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (
                HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            ),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageView {
    id: String,
    role: &'static str,
    content: String,
    created_at: i64,
}

impl From<StoredMessage> for MessageView {
    fn from(m: StoredMessage) -> Self {
        Self {
            id: m.id.0,
            role: m.role.as_str(),
            content: m.content,
            created_at: m.created_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TranscriptView {
    session_id: String,
    topic: String,
    messages: Vec<MessageView>,
}

/// GET /api/sessions/:id/messages for the owning user.
async fn session_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<TranscriptView>> {
    let user = match headers
        .get(AUTH_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        Some(u) => UserId(u.to_string()),
        None => return Err(StudyError::Unauthorized("Sign in to view sessions".to_string()).into()),
    };

    let session_id = crate::types::SessionId(id);
    let session = match db::get_session(&state.db, &session_id).await? {
        Some(s) => s,
        None => {
            return Err(StudyError::NotFound(format!("Session {} not found", session_id.short())).into())
        }
    };
    if session.user_id.as_ref() != Some(&user) {
        return Err(StudyError::Forbidden(format!(
            "Session {} belongs to another user",
            session_id.short()
        ))
        .into());
    }

    let messages = db::list_messages(&state.db, &session_id).await?;
    Ok(Json(TranscriptView {
        session_id: session.id.0,
        topic: session.topic,
        messages: messages.into_iter().map(MessageView::from).collect(),
    }))
}

/// POST /api/flashcards, streamed as NDJSON.
async fn flashcards(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<NdjsonBody> {
    let req = json_body(payload)?;
    let source = req.source()?;
    let (out, body) = ndjson::channel(NDJSON_CHANNEL_CAPACITY);
    let generator = state.generator.clone();
    tokio::spawn(
        async move { generator.stream_flashcards(req, source, out).await }.in_current_span(),
    );
    Ok(body)
}

/// POST /api/quiz, streamed as NDJSON, one model call per question.
async fn quiz(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<NdjsonBody> {
    let req = json_body(payload)?;
    let source = req.source()?;
    let (out, body) = ndjson::channel(NDJSON_CHANNEL_CAPACITY);
    let generator = state.generator.clone();
    tokio::spawn(async move { generator.stream_quiz(req, source, out).await }.in_current_span());
    Ok(body)
}

/// POST /api/mindmap
async fn mindmap(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<MindmapNode>> {
    let req = json_body(payload)?;
    let source = req.source()?;
    let tree = state.generator.mindmap(&source).await?;
    Ok(Json(tree))
}
