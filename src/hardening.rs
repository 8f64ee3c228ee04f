use crate::constants::RETRYABLE_STATUS_CODES;
use crate::types::{ObservedError, Result, StudyError};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::RwLock;

pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) if attempts < self.max_attempts && Self::is_retryable(&e) => {
                    let base_delay = self.base_delay_ms * 2u64.pow(attempts - 1);
                    // Jitter: ±25% of the base delay
                    let jitter_range = base_delay / 4;
                    let jitter = if jitter_range > 0 {
                        fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
                    } else {
                        0
                    };
                    let final_delay_ms = (base_delay as i64 + jitter).max(1) as u64;
                    let delay = Duration::from_millis(final_delay_ms);

                    tracing::warn!(
                        "Model request failed (attempt {}): {}. Retrying in {:?}...",
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn is_retryable(err: &ObservedError) -> bool {
        match &err.inner {
            StudyError::Network(_) | StudyError::Io(_) | StudyError::Timeout(_) => true,
            StudyError::Upstream(status, _) => RETRYABLE_STATUS_CODES.contains(&status.as_u16()),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

pub struct CircuitBreaker {
    state: Arc<RwLock<CircuitState>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    consecutive_failures: Arc<AtomicU32>,
    last_failure_time: Arc<RwLock<Option<Instant>>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_threshold,
            recovery_timeout,
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            last_failure_time: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    pub async fn check(&self) -> Result<()> {
        let mut state = self.state.write().await;

        if *state == CircuitState::Open {
            let last_failure = *self.last_failure_time.read().await;
            if let Some(last) = last_failure {
                if last.elapsed() > self.recovery_timeout {
                    tracing::info!("Circuit breaker transitioning to HALF-OPEN");
                    *state = CircuitState::HalfOpen;
                    return Ok(());
                }
            }

            return Err(StudyError::Upstream(
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                "Model circuit breaker is OPEN".to_string(),
            )
            .into());
        }
        Ok(())
    }

    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if *state != CircuitState::Closed {
            tracing::info!("Circuit breaker transitioning to CLOSED");
            *state = CircuitState::Closed;
        }
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_failure_time.write().await = Some(Instant::now());

        if failures >= self.failure_threshold && *state != CircuitState::Open {
            tracing::error!(
                "Circuit breaker transitioning to OPEN ({} consecutive failures)",
                failures
            );
            *state = CircuitState::Open;
        }
    }
}
