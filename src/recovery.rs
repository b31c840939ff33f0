//! Retry and backoff policy for transport operations.
//!
//! Channel sends and notification reconnects share one policy: capped
//! exponential backoff with a bounded attempt count. Delivery crediting is
//! the caller's job — an operation is only marked done after it succeeds, so
//! giving up here surfaces as a run-level failure, never as silent loss.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

/// Capped exponential backoff.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound on the delay between attempts.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// The delay to sleep after a failed attempt (zero-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds or the attempt budget is exhausted,
    /// sleeping the backoff delay between attempts. Returns the last error
    /// when all attempts fail.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 >= self.max_attempts => return Err(err),
                Err(_) => {
                    sleep(self.backoff_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = fast_policy(10);
        assert_eq!(policy.backoff_for(0), Duration::from_millis(1));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(2));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(4));
        assert_eq!(policy.backoff_for(5), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_run_succeeds_after_failures() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, &str> = fast_policy(4)
            .run(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("not yet")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), &str> = fast_policy(3)
            .run(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("always") }
            })
            .await;
        assert_eq!(result, Err("always"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
