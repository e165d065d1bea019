//! Capped exponential backoff for transient Store errors (spec.md §4.1:
//! "starting at 1 s, max 60 s").

use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the `attempt`-th retry (0-indexed): doubles each time,
    /// capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        scaled.min(self.max)
    }
}

/// Retries `op` until it succeeds or returns a non-transient error. Sleeps
/// between attempts per `policy`. Only [`StoreError::Transient`] is
/// retried; `group already exists` is handled by the caller (treated as
/// success), and `NoSuchKey`/`Protocol` are surfaced immediately.
pub async fn retry<F, Fut, T>(policy: &BackoffPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt = attempt.saturating_add(1);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_immediately_on_non_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result = retry(&BackoffPolicy::default(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(StoreError::Protocol("bad command".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result = retry(&BackoffPolicy::default(), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(StoreError::Transient("connection reset".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
