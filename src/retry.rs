use failsafe::backoff;
use std::future::Future;
use std::time::Duration;

use crate::errors::StoreError;

const MIN_DELAY: Duration = Duration::from_secs(1);

/// Bounded retry policy for storage calls.
///
/// # Configuration
///
/// - **Attempts**: total tries including the first one (minimum 1).
/// - **Backoff**: exponential from `base_delay`, capped at `max_delay`, in
///   whole seconds. Sub-second values are raised to 1s.
///
/// Only `StoreError::Transient` is retried; every other error is returned at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Delays slept between consecutive attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        // failsafe's exponential backoff counts whole seconds and asserts start/max >= 1s
        let start = Duration::from_secs(self.base_delay.as_secs()).max(MIN_DELAY);
        let max = Duration::from_secs(self.max_delay.as_secs()).max(start);
        backoff::exponential(start, max).take(self.max_attempts.saturating_sub(1) as usize)
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delays = policy.delays();
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => match delays.next() {
                Some(delay) => {
                    tracing::warn!(
                        "⚠️  {} failed (attempt {}/{}): {} - retrying in {:?}",
                        operation,
                        attempt,
                        policy.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    tracing::error!(
                        "❌ {} failed after {} attempt(s): {}",
                        operation,
                        attempt,
                        e
                    );
                    return Err(e);
                }
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_delay_count_matches_attempts() {
        assert_eq!(policy(3).delays().count(), 2);
        assert_eq!(policy(1).delays().count(), 0);
        assert_eq!(policy(0).delays().count(), 0);
    }

    #[test]
    fn test_default_delays_grow_and_cap() {
        let delays: Vec<Duration> = policy(5).delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
    }

    #[test]
    fn test_sub_second_delays_round_up() {
        let tiny = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let delays: Vec<Duration> = tiny.delays().collect();
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn test_default_policy_passes_success_through() {
        let result = with_backoff(&RetryPolicy::default(), "healthy", || async {
            Ok::<_, StoreError>("ok")
        })
        .await;
        assert_eq!(result, Ok("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_backoff(&policy(3), "flaky", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Transient("connection reset".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_backoff(&policy(3), "down", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Transient("pool timed out".into()))
        })
        .await;

        assert!(matches!(result, Err(StoreError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_backoff(&policy(5), "fatal", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Fatal("syntax error".into()))
        })
        .await;

        assert!(matches!(result, Err(StoreError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
