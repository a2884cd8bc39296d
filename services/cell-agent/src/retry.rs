//! Bounded retry with exponential backoff.
//!
//! Compensation calls (deleting an allocation, retracting a started claim)
//! must eventually succeed or be surfaced as a leak, so the HTTP collaborator
//! clients retry them a bounded number of times before reporting failure
//! upward.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Attempts made for a compensation call before its failure is surfaced.
pub const DEFAULT_COMPENSATION_ATTEMPTS: u32 = 3;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        // Add jitter
        let jitter_range = delay * self.jitter;
        let jitter = rand_jitter(jitter_range);
        let final_delay = (delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Simple jitter using a basic LCG (for no external deps).
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = (seed.wrapping_mul(6364136223846793005).wrapping_add(1)) as f64;
    let normalized = (random / u64::MAX as f64) * 2.0 - 1.0; // -1.0 to 1.0
    normalized * range
}

/// Run `op` until it succeeds or `max_attempts` attempts have been made,
/// sleeping per the backoff policy between attempts. The final error is
/// returned unchanged.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    max_attempts: u32,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(e);
                }

                let delay = policy.delay(attempt - 1);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn returns_first_success() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> =
            retry_with_backoff(&fast_policy(), 3, "test", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> =
            retry_with_backoff(&fast_policy(), 3, "test", || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_error_after_exhaustion() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> =
            retry_with_backoff(&fast_policy(), 3, "test", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("still broken".to_string())
            })
            .await;

        assert_eq!(result, Err("still broken".to_string()));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
