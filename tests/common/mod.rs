#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use studyhall::db::{init_db, upsert_user, DbPool};
use studyhall::frames::StreamFrame;
use studyhall::hardening::CircuitBreaker;
use studyhall::model::{ChatModel, ModelRequest, TokenStream};
use studyhall::types::{ObservedError, Result, StudyError, UserId};
use studyhall::{AppState, Args};
use tempfile::TempDir;

/// How a scripted stream ends after its fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Finish,
    Fail,
    Stall,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A `ChatModel` that replays canned output and records how it was used.
pub struct ScriptedModel {
    fragments: Vec<String>,
    end: StreamEnd,
    fail_to_start: bool,
    completions: Mutex<VecDeque<String>>,
    default_completion: String,
    complete_delay: Option<Duration>,
    pub stream_calls: AtomicUsize,
    pub complete_calls: AtomicUsize,
    pub fragments_pulled: Arc<AtomicUsize>,
    pub stream_dropped: Arc<AtomicBool>,
    pub last_request: Mutex<Option<ModelRequest>>,
}

impl ScriptedModel {
    pub fn streaming(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            end: StreamEnd::Finish,
            fail_to_start: false,
            completions: Mutex::new(VecDeque::new()),
            default_completion: String::new(),
            complete_delay: None,
            stream_calls: AtomicUsize::new(0),
            complete_calls: AtomicUsize::new(0),
            fragments_pulled: Arc::new(AtomicUsize::new(0)),
            stream_dropped: Arc::new(AtomicBool::new(false)),
            last_request: Mutex::new(None),
        }
    }

    pub fn completing(replies: &[&str]) -> Self {
        let model = Self::streaming(&[]);
        if let Ok(mut queue) = model.completions.lock() {
            queue.extend(replies.iter().map(|r| r.to_string()));
        }
        model
    }

    pub fn ending_with(mut self, end: StreamEnd) -> Self {
        self.end = end;
        self
    }

    pub fn failing_to_start(mut self) -> Self {
        self.fail_to_start = true;
        self
    }

    pub fn with_default_completion(mut self, reply: &str) -> Self {
        self.default_completion = reply.to_string();
        self
    }

    pub fn with_complete_delay(mut self, delay: Duration) -> Self {
        self.complete_delay = Some(delay);
        self
    }

    pub fn total_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst) + self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ModelRequest> {
        match self.last_request.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        }
    }

    fn record(&self, request: ModelRequest) {
        if let Ok(mut guard) = self.last_request.lock() {
            *guard = Some(request);
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn stream_chat(&self, request: ModelRequest) -> Result<TokenStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.record(request);
        if self.fail_to_start {
            return Err(StudyError::Upstream(
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                "scripted outage".to_string(),
            )
            .into());
        }

        let pulled = self.fragments_pulled.clone();
        let guard = DropFlag(self.stream_dropped.clone());
        let head = stream::iter(self.fragments.clone()).map(move |f| {
            let _ = &guard;
            pulled.fetch_add(1, Ordering::SeqCst);
            Ok::<String, ObservedError>(f)
        });

        let stream: TokenStream = match self.end {
            StreamEnd::Finish => Box::pin(head),
            StreamEnd::Fail => Box::pin(head.chain(stream::once(async {
                Err(StudyError::Upstream(
                    axum::http::StatusCode::BAD_GATEWAY,
                    "scripted mid-stream failure".to_string(),
                )
                .into())
            }))),
            StreamEnd::Stall => Box::pin(head.chain(stream::pending::<Result<String>>())),
        };
        Ok(stream)
    }

    async fn complete(&self, request: ModelRequest) -> Result<String> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.record(request);
        if let Some(delay) = self.complete_delay {
            tokio::time::sleep(delay).await;
        }
        let next = match self.completions.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(_) => None,
        };
        Ok(next.unwrap_or_else(|| self.default_completion.clone()))
    }
}

pub async fn test_db() -> (TempDir, DbPool) {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let pool = match init_db(dir.path().join("studyhall_test.db")).await {
        Ok(p) => p,
        Err(e) => panic!("Failed to init DB: {:?}", e),
    };
    (dir, pool)
}

pub async fn add_user(pool: &DbPool, id: &str) -> UserId {
    let user = UserId(id.to_string());
    if let Err(e) = upsert_user(pool, &user, None).await {
        panic!("Failed to add user {}: {:?}", id, e);
    }
    user
}

pub fn fast_args() -> Args {
    let mut args = Args::default();
    args.batch_delay_ms = 0;
    args.fragment_idle_timeout_secs = 2;
    args.step_timeout_secs = 2;
    args
}

pub async fn test_state(model: Arc<ScriptedModel>) -> (TempDir, Arc<AppState>) {
    let (dir, pool) = test_db().await;
    let circuit = Arc::new(CircuitBreaker::new(5, Duration::from_secs(30)));
    let state = AppState::new(pool, model, circuit, Arc::new(fast_args()));
    (dir, Arc::new(state))
}

/// Parses a chunked chat body into frames, one per line.
pub fn parse_frames(body: &[u8]) -> Vec<StreamFrame> {
    let text = match std::str::from_utf8(body) {
        Ok(t) => t,
        Err(e) => panic!("Body is not UTF-8: {:?}", e),
    };
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| match StreamFrame::decode(l) {
            Ok(f) => f,
            Err(e) => panic!("Undecodable frame {:?}: {:?}", l, e),
        })
        .collect()
}

pub async fn count_rows(pool: &DbPool, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {}", table);
    let row: (i64,) = match sqlx::query_as(&sql).fetch_one(pool).await {
        Ok(r) => r,
        Err(e) => panic!("Failed to count {}: {:?}", table, e),
    };
    row.0
}
