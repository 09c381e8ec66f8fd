//! Bounded exponential backoff for retried calls.

use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::warn;

use crate::error::CallError;

/// How many times and how patiently a call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub(crate) attempts: u32,
    pub(crate) base: Duration,
    pub(crate) max: Duration,
}

impl RetryPolicy {
    /// `attempts` includes the first call, so `1` means no retry.
    pub fn new(attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
            max,
        }
    }

    /// Delay before retry number `attempt` (0 based), jittered by up to 10%.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = calculate_backoff(attempt, self.base, self.max);
        let jitter_ms = (delay.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        delay
            .saturating_sub(Duration::from_millis(jitter_ms / 2))
            .saturating_add(Duration::from_millis(jitter))
            .min(self.max)
    }
}

/// `base * 2^attempt`, capped at `max`.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let backoff = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(backoff).min(max)
}

/// Failure of a retried call: how many attempts were made and the last error.
#[derive(Debug, Clone)]
pub struct RetryError {
    pub attempts: u32,
    pub last: CallError,
}

/// Runs `op` until it succeeds, fails with a non retryable error, or attempts run out.
pub async fn retry_call<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if !e.is_retryable() || attempt >= policy.attempts {
                    return Err(RetryError {
                        attempts: attempt,
                        last: e,
                    });
                }
                let delay = policy.backoff(attempt - 1);
                warn!(%e, attempt, ?delay, "{what} failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::{ErrorCode, ProtocolError, RpcError, TransportError};
    use crate::transport::Endpoint;

    fn timeout() -> CallError {
        TransportError::Timeout {
            endpoint: Endpoint::from("x"),
            timeout: Duration::from_millis(1),
        }
        .into()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        assert_eq!(calculate_backoff(0, base, max), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, base, max), Duration::from_millis(400));
        assert_eq!(calculate_backoff(10, base, max), max);
        assert_eq!(calculate_backoff(200, base, max), max);
    }

    #[test]
    fn jitter_stays_close() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        for _ in 0..50 {
            let d = policy.backoff(1);
            assert!(d >= Duration::from_millis(190) && d <= Duration::from_millis(210));
        }
    }

    #[tokio::test]
    async fn retries_transport_errors_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(4, Duration::from_millis(1), Duration::from_millis(2));
        let result = retry_call(policy, "test call", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(timeout())
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let err = retry_call(policy, "test call", || async { Err::<(), _>(timeout()) })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2));
        let err = retry_call(policy, "test call", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CallError::from(ProtocolError::Rejected(RpcError::new(
                ErrorCode::LeagueFull,
                "full",
            ))))
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
