use super::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[test]
fn test_delay_grows_and_caps() {
    let config = RetryConfig::new()
        .with_initial_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_millis(500))
        .with_jitter(false);

    assert_eq!(config.delay_for(1), Duration::from_millis(100));
    assert_eq!(config.delay_for(2), Duration::from_millis(200));
    assert_eq!(config.delay_for(3), Duration::from_millis(400));
    assert_eq!(config.delay_for(4), Duration::from_millis(500));
    assert_eq!(config.delay_for(200), Duration::from_millis(500));
}

#[test]
fn test_custom_multiplier() {
    let config = RetryConfig::new()
        .with_initial_delay(Duration::from_millis(100))
        .with_backoff_multiplier(3.0)
        .with_jitter(false);

    assert_eq!(config.delay_for(1), Duration::from_millis(100));
    assert_eq!(config.delay_for(2), Duration::from_millis(300));
    assert_eq!(config.delay_for(3), Duration::from_millis(900));
}

#[test]
fn test_jitter_stays_within_quarter() {
    let config = RetryConfig::new()
        .with_initial_delay(Duration::from_millis(400))
        .with_jitter(true);

    for _ in 0..50 {
        let delay = config.delay_for(1);
        assert!(delay >= Duration::from_millis(400));
        assert!(delay <= Duration::from_millis(500));
    }
}

#[test]
fn test_zero_attempts_retries_forever() {
    let config = RetryConfig::new().with_max_attempts(0);
    assert!(config.allows(1_000));

    let config = RetryConfig::new().with_max_attempts(3);
    assert!(config.allows(2));
    assert!(!config.allows(3));
}

#[tokio::test(start_paused = true)]
async fn test_retry_success_after_failures() {
    let config = RetryConfig::new().with_max_attempts(5);
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let result: Result<u32, RetryError<&str>> = retry_with_backoff(
        &config,
        || {
            let c = counter_clone.clone();
            async move {
                let count = c.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err("connection refused")
                } else {
                    Ok(count)
                }
            }
        },
        |_| true,
    )
    .await;

    assert_eq!(result.unwrap(), 2);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhausts_budget() {
    let config = RetryConfig::new().with_max_attempts(3);
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let result: Result<(), RetryError<&str>> = retry_with_backoff(
        &config,
        || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("connection refused")
            }
        },
        |_| true,
    )
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.attempts, 3);
    assert_eq!(err.last_error, "connection refused");
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_non_retryable_error_stops_immediately() {
    let config = RetryConfig::new().with_max_attempts(3);
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let result: Result<(), RetryError<&str>> = retry_with_backoff(
        &config,
        || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("authentication failed")
            }
        },
        |_| false,
    )
    .await;

    assert!(result.is_err());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
