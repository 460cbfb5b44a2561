//! Tests for the retry wrapper.

use std::sync::atomic::{AtomicU32, Ordering};

use super::*;
use rstest::rstest;

#[derive(Debug, Eq, PartialEq)]
struct ProbeFailed(u32);

impl Display for ProbeFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "probe failed on call {}", self.0)
    }
}

const FAST: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4));

#[rstest]
#[tokio::test]
async fn always_failing_operation_runs_exactly_max_attempts() {
    let calls = AtomicU32::new(0);
    let result: Result<(), ProbeFailed> = with_retry(&FAST, "probe", || {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Err(ProbeFailed(call)) }
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result, Err(ProbeFailed(3)), "last error is returned verbatim");
}

#[rstest]
#[tokio::test]
async fn succeeds_once_the_operation_recovers() {
    let calls = AtomicU32::new(0);
    let result = with_retry(&FAST, "probe", || {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if call < 2 {
                Err(ProbeFailed(call))
            } else {
                Ok(call)
            }
        }
    })
    .await;

    assert_eq!(result, Ok(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[rstest]
#[tokio::test]
async fn zero_attempts_still_runs_once() {
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1));
    let result = with_retry(&policy, "probe", || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>(ProbeFailed(1)) }
    })
    .await;

    assert_eq!(result, Err(ProbeFailed(1)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[rstest]
#[case(1, 100)]
#[case(2, 200)]
#[case(3, 400)]
#[case(6, 1000)]
fn delays_double_and_are_capped(#[case] attempt: u32, #[case] expected_ms: u64) {
    let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1));
    assert_eq!(policy.delay_after(attempt), Duration::from_millis(expected_ms));
}

#[rstest]
fn delay_saturates_for_large_attempt_numbers() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_after(200), DEFAULT_MAX_DELAY);
}

#[rstest]
#[tokio::test]
async fn outer_budget_cancels_backoff_sleep() {
    let policy = RetryPolicy::new(5, Duration::from_secs(30), Duration::from_secs(30));
    let result: Result<(), RetryError<ProbeFailed>> =
        with_retry_within(&policy, "probe", Duration::from_millis(50), || async {
            Err(ProbeFailed(1))
        })
        .await;

    assert!(
        matches!(result, Err(RetryError::DeadlineExceeded { ref operation, .. }) if operation == "probe"),
        "unexpected result: {result:?}"
    );
}

#[rstest]
#[tokio::test]
async fn within_budget_surfaces_operation_error() {
    let result: Result<(), RetryError<ProbeFailed>> =
        with_retry_within(&FAST, "probe", Duration::from_secs(5), || async {
            Err(ProbeFailed(7))
        })
        .await;

    assert_eq!(result, Err(RetryError::Operation(ProbeFailed(7))));
}
