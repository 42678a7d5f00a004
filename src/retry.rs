//! Exponential backoff retry logic for transport calls.
//!
//! One retry policy object serves both the poller and the forwarder, so the
//! backoff curve, jitter, and the rate-limit override live in a single place
//! instead of being scattered per call site.
//!
//! - Transient errors are retried with exponentially growing, jittered delays.
//! - Rate-limit errors sleep for exactly the platform-mandated wait, which
//!   takes precedence over the computed backoff and does not consume a retry
//!   attempt (the platform told us when to come back; that is not a failure
//!   of ours to budget).
//! - Permission and invalid-target errors are returned immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::transport::TransportError;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (cap for exponential growth).
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0).
    pub backoff_multiplier: f64,

    /// Jitter percentage added on top of each delay (0-100).
    ///
    /// Each computed delay is stretched by a random factor in
    /// `[1.0, 1.0 + jitter_percent / 100]` so simultaneous retries from
    /// several workers do not align.
    pub jitter_percent: u8,
}

impl RetryConfig {
    /// Default retry configuration for forward operations.
    ///
    /// 3 retries with 2s, 4s, 8s base delays.
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(60),
        backoff_multiplier: 2.0,
        jitter_percent: 20,
    };

    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
            jitter_percent: 0,
        }
    }

    /// Computes the base delay for the given retry attempt (0-indexed),
    /// before jitter.
    ///
    /// The delay grows exponentially: `initial_delay * multiplier^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }

    /// The delay for an attempt with jitter applied.
    pub fn jittered_delay_for_attempt(&self, attempt: u32) -> Duration {
        apply_jitter(self.delay_for_attempt(attempt), self.jitter_percent)
    }

    /// Returns an iterator over all base retry delays.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Stretches a duration by a random factor in `[1.0, 1.0 + percent/100]`.
pub fn apply_jitter(base: Duration, percent: u8) -> Duration {
    if percent == 0 {
        return base;
    }
    let factor = 1.0 + rand::rng().random_range(0.0..(percent as f64 / 100.0));
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryResult<T> {
    /// The operation succeeded.
    Success(T),

    /// A transient error persisted through all retries.
    ExhaustedRetries {
        /// The last error encountered.
        last_error: TransportError,
        /// Number of attempts made (including the initial attempt).
        attempts: u32,
    },

    /// A permission or invalid-target error; retrying cannot help.
    PermanentError(TransportError),

    /// The destination cannot take an atomic grouped send. The caller decides
    /// whether to degrade to per-item delivery; a blind retry would just fail
    /// again.
    GroupedUnsupported,
}

impl<T> RetryResult<T> {
    /// Converts to a Result, treating everything but success as Err.
    pub fn into_result(self) -> Result<T, TransportError> {
        match self {
            RetryResult::Success(v) => Ok(v),
            RetryResult::ExhaustedRetries { last_error, .. } => Err(last_error),
            RetryResult::PermanentError(e) => Err(e),
            RetryResult::GroupedUnsupported => Err(TransportError::GroupedUnsupported),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryResult::Success(_))
    }
}

/// Executes an async operation with retry logic.
///
/// The operation is retried on transient errors according to `config`.
/// Rate-limit errors sleep for the mandated wait without consuming an
/// attempt. Permanent errors and grouped-unsupported are returned
/// immediately.
pub async fn retry_with_backoff<T, F, Fut>(config: RetryConfig, mut operation: F) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let max_attempts = config.max_retries + 1; // Include initial attempt
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return RetryResult::Success(value),
            Err(TransportError::RateLimited { retry_after }) => {
                // Mandated wait; overrides the backoff curve and is budgeted
                // separately from transient failures.
                tracing::warn!(wait = ?retry_after, "rate limited, honoring mandated wait");
                tokio::time::sleep(retry_after).await;
            }
            Err(TransportError::GroupedUnsupported) => {
                return RetryResult::GroupedUnsupported;
            }
            Err(e @ (TransportError::PermissionDenied(_) | TransportError::InvalidTarget(_))) => {
                return RetryResult::PermanentError(e);
            }
            Err(e @ TransportError::Transient(_)) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return RetryResult::ExhaustedRetries {
                        last_error: e,
                        attempts: attempt,
                    };
                }
                let delay = config.jittered_delay_for_attempt(attempt - 1);
                tracing::debug!(attempt, max_attempts, delay = ?delay, error = %e, "retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(10),
            2.0,
        )
    }

    #[test]
    fn default_delays_are_2_4_8() {
        let config = RetryConfig::DEFAULT;
        let delays: Vec<_> = config.delays().collect();
        assert_eq!(delays.len(), 3);
        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[1], Duration::from_secs(4));
        assert_eq!(delays[2], Duration::from_secs(8));
    }

    #[test]
    fn zero_jitter_is_identity() {
        let base = Duration::from_secs(7);
        assert_eq!(apply_jitter(base, 0), base);
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_backoff(fast_config(3), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TransportError>(42) }
        })
        .await;

        assert!(result.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_error_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_backoff(fast_config(3), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(TransportError::PermissionDenied("kicked".into())) }
        })
        .await;

        assert!(matches!(result, RetryResult::PermanentError(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn grouped_unsupported_surfaces_immediately() {
        let result = retry_with_backoff(fast_config(3), || async {
            Err::<i32, _>(TransportError::GroupedUnsupported)
        })
        .await;

        assert!(matches!(result, RetryResult::GroupedUnsupported));
    }

    #[tokio::test]
    async fn transient_succeeds_within_budget() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_backoff(fast_config(3), move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 3 {
                    Err(TransportError::Transient("flaky".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        // Fails 3 times, succeeds on the 4th attempt (3 retries allowed).
        assert!(result.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn transient_exhausts_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_backoff(fast_config(2), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(TransportError::Transient("always fails".into())) }
        })
        .await;

        match result {
            RetryResult::ExhaustedRetries { attempts, .. } => {
                assert_eq!(attempts, 3); // Initial + 2 retries
            }
            other => panic!("expected ExhaustedRetries, got {other:?}"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_mandated_duration_without_consuming_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let started = tokio::time::Instant::now();
        // Zero retries: any transient failure would exhaust immediately, so a
        // success after two rate limits proves they did not consume attempts.
        let result = retry_with_backoff(fast_config(0), move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err(TransportError::RateLimited {
                        retry_after: Duration::from_secs(30),
                    })
                } else {
                    Ok(1)
                }
            }
        })
        .await;

        assert!(result.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    proptest! {
        #[test]
        fn delay_grows_until_cap(
            initial_ms in 1u64..1000,
            max_ms in 1000u64..60000,
            multiplier in 1.5f64..3.0,
            attempt in 0u32..10,
        ) {
            let config = RetryConfig::new(
                10,
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
                multiplier,
            );

            let delay = config.delay_for_attempt(attempt);
            prop_assert!(delay <= Duration::from_millis(max_ms));

            if attempt > 0 {
                let prev_delay = config.delay_for_attempt(attempt - 1);
                prop_assert!(delay >= prev_delay);
            }
        }

        #[test]
        fn jitter_stays_within_bounds(
            base_ms in 1u64..60_000,
            percent in 0u8..100,
        ) {
            let base = Duration::from_millis(base_ms);
            let jittered = apply_jitter(base, percent);
            prop_assert!(jittered >= base);
            let upper = base.as_secs_f64() * (1.0 + percent as f64 / 100.0);
            prop_assert!(jittered.as_secs_f64() <= upper + f64::EPSILON * upper);
        }
    }
}
