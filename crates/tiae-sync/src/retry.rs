//! Bounded retry with capped exponential backoff.
//!
//! A post-commit action is attempted up to `max_attempts` times. Between
//! attempts the task sleeps `initial_backoff * multiplier^(n-1)`, capped at
//! `max_backoff`. Retrying stops early when the error is not transient,
//! when a newer run supersedes this one, or on shutdown.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            multiplier: 2,
            max_backoff: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Sleep after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Why a retried action gave up.
#[derive(Debug, Clone)]
pub enum RetryError {
    /// Every attempt failed transiently.
    Exhausted { attempts: u32, last_error: AdapterError },
    /// A permanent failure; no further attempts were made.
    Rejected { attempts: u32, error: AdapterError },
    /// A newer run for the same target took over.
    Superseded { attempts: u32 },
    Cancelled { attempts: u32 },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Rejected { attempts, .. }
            | RetryError::Superseded { attempts }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }

    /// Failures that need an out-of-band reconciler.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. } | RetryError::Rejected { .. })
    }

    pub fn last_error(&self) -> Option<&AdapterError> {
        match self {
            RetryError::Exhausted { last_error, .. } => Some(last_error),
            RetryError::Rejected { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Run `operation` under `policy`.
///
/// `still_current` is checked before every attempt; once it returns
/// `false` the loop stops with [`RetryError::Superseded`]. Each attempt is
/// bounded by `call_timeout`.
pub async fn retry<T, F, Fut, C>(
    policy: &RetryPolicy,
    call_timeout: Duration,
    cancel: &CancellationToken,
    label: &str,
    mut still_current: C,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
    C: FnMut() -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        if !still_current() {
            debug!(action = label, attempt, "Superseded by a newer run");
            return Err(RetryError::Superseded { attempts: attempt });
        }
        attempt += 1;

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
            res = tokio::time::timeout(call_timeout, operation()) => {
                res.unwrap_or(Err(AdapterError::Timeout))
            }
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_transient() {
            return Err(RetryError::Rejected {
                attempts: attempt,
                error: err,
            });
        }
        if attempt >= policy.max_attempts.max(1) {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last_error: err,
            });
        }

        let backoff = policy.delay(attempt);
        warn!(
            action = label,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Post-commit action failed, retrying"
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
            () = tokio::time::sleep(backoff) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(4);

    #[test]
    fn delays_double_and_cap() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(1), Duration::from_millis(250));
        assert_eq!(p.delay(2), Duration::from_millis(500));
        assert_eq!(p.delay(4), Duration::from_secs(2));
        assert_eq!(p.delay(8), Duration::from_secs(30));
        assert_eq!(p.delay(200), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();
        let c = calls.clone();
        let out = retry(
            &RetryPolicy::default(),
            TIMEOUT,
            &CancellationToken::new(),
            "test",
            || true,
            move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AdapterError::Transient("flaky".into()))
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 250 ms + 500 ms of backoff.
        assert_eq!(started.elapsed(), Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let err = retry(
            &RetryPolicy::default(),
            TIMEOUT,
            &CancellationToken::new(),
            "test",
            || true,
            || async { Err::<(), _>(AdapterError::Transient("down".into())) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 5, .. }));
        assert!(err.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_stop_immediately() {
        let err = retry(
            &RetryPolicy::default(),
            TIMEOUT,
            &CancellationToken::new(),
            "test",
            || true,
            || async { Err::<(), _>(AdapterError::Rejected("forbidden".into())) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert!(matches!(err, RetryError::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_runs_stop_quietly() {
        let checks = AtomicU32::new(0);
        let err = retry(
            &RetryPolicy::default(),
            TIMEOUT,
            &CancellationToken::new(),
            "test",
            || checks.fetch_add(1, Ordering::SeqCst) == 0,
            || async { Err::<(), _>(AdapterError::Transient("down".into())) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RetryError::Superseded { attempts: 1 }));
        assert!(!err.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let err = retry(
            &RetryPolicy {
                max_attempts: 2,
                ..RetryPolicy::default()
            },
            TIMEOUT,
            &CancellationToken::new(),
            "test",
            || true,
            || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            RetryError::Exhausted {
                attempts: 2,
                last_error: AdapterError::Timeout
            }
        ));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = retry(
            &RetryPolicy::default(),
            TIMEOUT,
            &cancel,
            "test",
            || true,
            || async { Ok(()) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RetryError::Cancelled { attempts: 0 }));
    }
}
