//! Bounded retry-with-timeout for outbound calls. Every network dependency
//! (model invocation, listing scrape) goes through the same primitive so the
//! attempt budget, per-attempt deadline, and cancellation behavior are
//! uniform across call sites.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed or timed out. `last` is `None` when the final
    /// attempt ended in a timeout rather than an operation error.
    #[error("{label} gave up after {attempts} attempts")]
    Exhausted { label: &'static str, attempts: u32, last: Option<E> },
    #[error("cancelled while retrying")]
    Cancelled,
}

/// Runs `op` up to `attempts` times, each bounded by `per_attempt`.
/// Cancellation wins over everything else and is never retried; a cancelled
/// call returns without invoking `op` again.
pub async fn retry_with_timeout<T, E, F, Fut>(
    label: &'static str,
    attempts: u32,
    per_attempt: Duration,
    token: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut last: Option<E> = None;

    for attempt in 1..=attempts {
        if token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        if attempt > 1 {
            let backoff = backoff_with_jitter(attempt);
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RetryError::Cancelled),
            outcome = tokio::time::timeout(per_attempt, op()) => outcome,
        };
        match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => {
                warn!(label, attempt, error = %error, "attempt failed");
                last = Some(error);
            }
            Err(_) => {
                warn!(
                    label,
                    attempt,
                    timeout_ms = per_attempt.as_millis() as u64,
                    "attempt timed out"
                );
                last = None;
            }
        }
    }

    Err(RetryError::Exhausted { label, attempts, last })
}

/// 250ms doubling per retry, capped, plus up to 250ms of jitter so
/// synchronized callers spread out.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 250u64.saturating_mul(1 << attempt.saturating_sub(2).min(6));
    let jitter = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(base + jitter)
}
