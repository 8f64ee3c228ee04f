use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Request, Response},
    middleware::Next,
};
use std::panic;
use std::time::Duration;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every request with an id (reusing the caller's when present) and echoes it back.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = match req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(existing) => existing.to_string(),
        None => Uuid::new_v4().to_string(),
    };

    let header = HeaderValue::from_str(&request_id).ok();
    if let Some(val) = &header {
        req.headers_mut().insert(REQUEST_ID_HEADER, val.clone());
    }

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut response = next.run(req).instrument(span).await;
    if let Some(val) = header {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

pub fn request_id(headers: &HeaderMap) -> String {
    match headers.get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
        Some(id) => id.to_string(),
        None => "unknown".to_string(),
    }
}

/// Counters for one streamed answer.
#[derive(Debug, Default, Clone)]
pub struct StreamMetric {
    pub fragments: usize,
    pub batches: usize,
    pub frames: usize,
    pub text_chars: usize,
    pub first_fragment_after: Option<Duration>,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fragment(&mut self, fragment: &str, elapsed: Duration) {
        self.fragments += 1;
        self.text_chars += fragment.chars().count();
        if self.first_fragment_after.is_none() {
            self.first_fragment_after = Some(elapsed);
        }
    }

    pub fn record_batch(&mut self) {
        self.batches += 1;
    }

    pub fn log_summary(&self, outcome: &str, latency: Duration) {
        let ttft = match self.first_fragment_after {
            Some(d) => format!("{:?}", d),
            None => "n/a".to_string(),
        };
        info!(
            target: "stream",
            "[STREAM END] Outcome: {} | Fragments: {} | Batches: {} | Frames: {} | Text: {} chars | First fragment: {} | Latency: {:?}",
            outcome, self.fragments, self.batches, self.frames, self.text_chars, ttft, latency
        );
    }
}
