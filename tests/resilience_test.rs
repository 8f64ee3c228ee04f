use std::time::Duration;
use studyhall::hardening::*;
use studyhall::types::*;

#[tokio::test]
async fn test_retry_policy_success() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: studyhall::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Ok(42) }
        })
        .await;

    match result {
        Ok(val) => assert_eq!(val, 42),
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_retry_policy_eventual_success() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: studyhall::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            let a = attempts;
            async move {
                if a < 3 {
                    Err(StudyError::Timeout("slow".to_string()).into())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

    match result {
        Ok(val) => assert_eq!(val, 42),
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn test_retry_policy_does_not_retry_client_errors() {
    let policy = RetryPolicy::new(5, 1);
    let mut attempts = 0;

    let result: studyhall::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move {
                Err(StudyError::Upstream(
                    axum::http::StatusCode::BAD_REQUEST,
                    "bad model id".to_string(),
                )
                .into())
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_retryable_classification() {
    let overloaded: ObservedError =
        StudyError::Upstream(axum::http::StatusCode::TOO_MANY_REQUESTS, "slow down".into()).into();
    assert!(RetryPolicy::is_retryable(&overloaded));

    let invalid: ObservedError = StudyError::Validation("nope".into()).into();
    assert!(!RetryPolicy::is_retryable(&invalid));
}

#[tokio::test]
async fn test_circuit_breaker_trips() {
    let cb = CircuitBreaker::new(2, Duration::from_secs(1));

    cb.record_failure().await;
    assert!(cb.check().await.is_ok());

    // Second failure - should trip
    cb.record_failure().await;
    assert!(cb.check().await.is_err());
    assert_eq!(cb.state().await, CircuitState::Open);
}

#[tokio::test]
async fn test_circuit_breaker_recovery() {
    let cb = CircuitBreaker::new(1, Duration::from_millis(50));

    cb.record_failure().await;
    assert!(cb.check().await.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Should be half-open and allow one request
    assert!(cb.check().await.is_ok());
    assert_eq!(cb.state().await, CircuitState::HalfOpen);

    cb.record_success().await;
    assert_eq!(cb.state().await, CircuitState::Closed);
}
