//! Retry utilities
//!
//! Generic fixed-interval retry harness. Used by worker cleanup to retry
//! `EBUSY` unmounts (§4.5: up to 10 attempts, ~5s apart) without duplicating
//! the attempt-loop/classifier machinery at each call site.

use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Configuration for a fixed-interval retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding the initial attempt)
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    /// The retry policy for unmount-EBUSY per §4.5: up to 10 retries, ~5s apart.
    pub fn unmount_busy() -> Self {
        Self::new(10, Duration::from_secs(5))
    }
}

/// Error classification result for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Stop,
}

pub type ErrorClassifier<E> = fn(&E) -> RetryDecision;

/// Default error classifier that retries on all errors
pub fn default_classifier<E>(_error: &E) -> RetryDecision {
    RetryDecision::Retry
}

/// Retry an async operation at a fixed interval, stopping early if
/// `classify_error` decides the error is terminal.
#[instrument(level = "debug", skip(operation, classify_error))]
pub async fn retry_async<T, E, Fut, Op>(
    config: &RetryConfig,
    operation: Op,
    classify_error: ErrorClassifier<E>,
) -> std::result::Result<T, E>
where
    Op: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Debug,
{
    let mut last_error = None;

    for attempt in 0..=config.max_attempts {
        debug!(attempt, max = config.max_attempts, "retry attempt");

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt, "operation succeeded after retrying");
                }
                return Ok(result);
            }
            Err(error) => {
                if classify_error(&error) == RetryDecision::Stop {
                    debug!("error classifier indicated stop, not retrying");
                    return Err(error);
                }

                last_error = Some(error);

                if attempt < config.max_attempts {
                    tokio::time::sleep(config.delay).await;
                }
            }
        }
    }

    let final_error = last_error.expect("at least one attempt was made");
    warn!(
        attempts = config.max_attempts + 1,
        ?final_error,
        "all retry attempts exhausted"
    );
    Err(final_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn unmount_busy_policy_matches_spec() {
        let cfg = RetryConfig::unmount_busy();
        assert_eq!(cfg.max_attempts, 10);
        assert_eq!(cfg.delay, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let config = RetryConfig::new(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result = retry_async(
            &config,
            move || {
                let c = Arc::clone(&calls2);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<i32, &'static str>(42)
                }
            },
            default_classifier,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let config = RetryConfig::new(5, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result = retry_async(
            &config,
            move || {
                let c = Arc::clone(&calls2);
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("busy")
                    } else {
                        Ok(7)
                    }
                }
            },
            default_classifier,
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_all_attempts() {
        let config = RetryConfig::new(2, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result: std::result::Result<i32, &'static str> = retry_async(
            &config,
            move || {
                let c = Arc::clone(&calls2);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("busy")
                }
            },
            default_classifier,
        )
        .await;

        assert_eq!(result.unwrap_err(), "busy");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_early_on_terminal_classification() {
        let config = RetryConfig::new(5, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let classifier = |e: &i32| if *e == 1 { RetryDecision::Stop } else { RetryDecision::Retry };

        let result = retry_async(
            &config,
            move || {
                let c = Arc::clone(&calls2);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, i32>(1)
                }
            },
            classifier,
        )
        .await;

        assert_eq!(result.unwrap_err(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
