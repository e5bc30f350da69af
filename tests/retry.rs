//! Retry Integration Tests
//!
//! Tests for the attempt bound and backoff of the retry executor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use presswork::core::{RetryExecutor, RetryOutcome, RetryPolicy};

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay_ms: 10,
        max_delay_ms: 50,
        backoff_multiplier: 2.0,
    }
}

#[tokio::test]
async fn test_fails_once_then_succeeds_in_two_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let executor = RetryExecutor::new(fast_policy(2));

    let outcome = executor
        .execute("fetch", |_| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("connection reset");
                }
                Ok("content")
            }
        })
        .await;

    match outcome {
        RetryOutcome::Succeeded { value, attempts } => {
            assert_eq!(value, "content");
            assert_eq!(attempts, 2);
        }
        RetryOutcome::Exhausted { error, .. } => panic!("unexpected failure: {}", error),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_always_failing_stops_at_bound() {
    for bound in [1, 2, 4] {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(fast_policy(bound));

        let outcome: RetryOutcome<()> = executor
            .execute("review", |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("attempt {} failed", attempt)
                }
            })
            .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts(), bound);
        assert_eq!(calls.load(Ordering::SeqCst), bound);
        if let RetryOutcome::Exhausted { error, .. } = outcome {
            assert_eq!(error.to_string(), format!("attempt {} failed", bound));
        }
    }
}

#[tokio::test]
async fn test_backoff_sleeps_between_attempts() {
    let executor = RetryExecutor::new(RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 40,
        max_delay_ms: 1000,
        backoff_multiplier: 2.0,
    });

    let started = Instant::now();
    let outcome: RetryOutcome<()> = executor
        .execute("draft", |_| async { anyhow::bail!("still down") })
        .await;

    // 40ms after the first attempt, 80ms after the second
    assert_eq!(outcome.attempts(), 3);
    assert!(started.elapsed() >= Duration::from_millis(120));
}

#[tokio::test]
async fn test_zero_bound_still_attempts_once() {
    let executor = RetryExecutor::new(fast_policy(0));
    let outcome = executor.execute("edit", |_| async { Ok(7) }).await;
    assert!(outcome.is_success());
    assert_eq!(outcome.attempts(), 1);
}
