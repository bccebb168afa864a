use crate::clock::Sleeper;
use crate::error::{Result, StoreError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff with an attempt cap and optional full jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(1_000),
            multiplier: 2,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Retries immediately, without sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1,
            jitter: false,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before retry number `retry` (1-based). Without jitter this is
    /// `base * multiplier^(retry-1)` capped at `max_delay`; with jitter it is
    /// drawn uniformly from zero up to that value.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        let base_ms = self.base_delay.as_millis() as u64;
        let capped_ms = base_ms
            .saturating_mul(factor)
            .min(self.max_delay.as_millis() as u64);
        if self.jitter && capped_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=capped_ms))
        } else {
            Duration::from_millis(capped_ms)
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent. The attempt number (1-based) is passed
/// to `op`. On exhaustion the last error is returned unchanged.
pub async fn with_backoff<T, E, F, Fut, R>(
    policy: &BackoffPolicy,
    sleeper: &dyn Sleeper,
    is_retryable: R,
    mut op: F,
) -> std::result::Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && is_retryable(&err) => {
                let delay = policy.delay_for(attempt);
                debug!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient error"
                );
                sleeper.sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// `with_backoff` retrying the store's transient kinds: guard conflicts and
/// canceled transactions.
pub async fn retry_transient<T, F, Fut>(
    policy: &BackoffPolicy,
    sleeper: &dyn Sleeper,
    op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_backoff(policy, sleeper, StoreError::is_transient, op).await
}

#[cfg(test)]
mod tests {
    use super::{BackoffPolicy, retry_transient, with_backoff};
    use crate::clock::{Clock, ClockSleeper, ManualClock, TokioSleeper};
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fixed_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2,
            jitter: false,
        }
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = fixed_policy(10);
        let delays: Vec<u128> = (1..=5).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);
    }

    #[test]
    fn jittered_delay_never_exceeds_cap() {
        let policy = BackoffPolicy {
            jitter: true,
            ..fixed_policy(10)
        };
        for retry in 1..20 {
            assert!(policy.delay_for(retry) <= Duration::from_millis(50));
        }
    }

    #[tokio::test]
    async fn retries_until_success_and_sleeps_between() {
        let clock = ManualClock::new(0);
        let sleeper = ClockSleeper::new(clock.clone());
        let calls = AtomicU32::new(0);

        let value = with_backoff(
            &fixed_policy(5),
            &sleeper,
            |_: &String| true,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("busy {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await
        .expect("third attempt succeeds");

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(clock.now_ms(), 10 + 20);
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let err = retry_transient(&BackoffPolicy::immediate(5), &TokioSleeper, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(StoreError::unavailable("down")) }
        })
        .await
        .expect_err("unavailable is not retried");
        assert_eq!(err.code_str(), "store_unavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let err = retry_transient(&BackoffPolicy::immediate(3), &TokioSleeper, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(StoreError::TransactionCanceled {
                    reasons: Vec::new(),
                })
            }
        })
        .await
        .expect_err("always canceled");
        assert_eq!(err.code_str(), "transaction_canceled");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
