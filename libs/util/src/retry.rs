//! Bounded retry with per-attempt timeout, overall deadline and jitter.
//! Callers classify each failure as retriable or aborting.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Budget for one attempt.
    pub attempt_timeout: Duration,
    /// Budget for the whole operation.
    pub deadline: Duration,
    /// Pause between attempts, before jitter.
    pub interval: Duration,
    /// Uniform random addition to the pause.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// The remote-signing policy: 20 s overall, 2 s per attempt, 100 ms
    /// jitter.
    pub fn signing() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(2),
            deadline: Duration::from_secs(20),
            interval: Duration::from_millis(200),
            jitter: Duration::from_millis(100),
        }
    }
}

/// Failure classification returned by an attempt.
#[derive(Debug)]
pub enum Attempt<E> {
    /// Expected failure; try again within the budget.
    Retry(E),
    /// Fatal failure; stop immediately.
    Abort(E),
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::fmt::Display> {
    #[error("aborted: {0}")]
    Aborted(E),

    #[error("deadline exceeded after {attempts} attempts, last error: {last}")]
    DeadlineExceeded { attempts: u32, last: E },

    #[error("deadline exceeded after {attempts} attempts, every attempt timed out")]
    TimedOut { attempts: u32 },
}

/// Run `f` until it succeeds, the classification aborts, or the deadline
/// passes.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut f: F) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let started = Instant::now();
    let mut attempts = 0u32;
    let mut last: Option<E> = None;

    loop {
        attempts += 1;
        match tokio::time::timeout(policy.attempt_timeout, f()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(Attempt::Abort(e))) => return Err(RetryError::Aborted(e)),
            Ok(Err(Attempt::Retry(e))) => {
                debug!(msg = "attempt failed, retrying", attempts, error = %e);
                last = Some(e);
            }
            Err(_elapsed) => {
                debug!(msg = "attempt timed out, retrying", attempts);
            }
        }

        let jitter_millis = policy.jitter.as_millis() as u64;
        let jitter = if jitter_millis == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..jitter_millis))
        };
        let pause = policy.interval + jitter;

        if started.elapsed() + pause >= policy.deadline {
            return Err(match last {
                Some(last) => RetryError::DeadlineExceeded { attempts, last },
                None => RetryError::TimedOut { attempts },
            });
        }
        tokio::time::sleep(pause).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: Duration::from_millis(50),
            deadline: Duration::from_millis(500),
            interval: Duration::from_millis(1),
            jitter: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = retry(quick_policy(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Attempt::Retry("not yet"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_abort_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = retry(quick_policy(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Attempt::Abort("bad input"))
        })
        .await;
        assert!(matches!(result, Err(RetryError::Aborted(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let result: Result<u32, _> = retry(quick_policy(), || async {
            Err(Attempt::Retry("still failing"))
        })
        .await;
        assert!(matches!(
            result,
            Err(RetryError::DeadlineExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_retry() {
        let result: Result<u32, RetryError<&str>> = retry(quick_policy(), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1)
        })
        .await;
        assert!(matches!(result, Err(RetryError::TimedOut { .. })));
    }
}
