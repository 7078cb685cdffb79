//! Timeout + retry harness shared by every stage invocation.
//!
//! ## Retry Strategy
//!
//! Only [`StageError::Retryable`] failures and timeouts are retried, with
//! `initial_backoff * 2^(attempt-1)` between attempts (capped). With the
//! default Infer policy (4 attempts, 500 ms base) the wait sequence is
//! 500 ms → 1 s → 2 s. Input and Fatal errors return after a single attempt.
//! When the budget runs out the last transient error is converted into a
//! Fatal one so the caller never has to re-derive "exhausted".

use crate::config::RetryPolicy;
use crate::error::StageError;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// What the orchestrator observes for one stage invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Success {
        value: T,
        attempts: u32,
        duration_ms: u64,
    },
    Failed {
        error: StageError,
        attempts: u32,
        /// The last attempt ended by timeout rather than an error.
        timed_out: bool,
        duration_ms: u64,
    },
}

impl<T> StageOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            StageOutcome::Success { attempts, .. } | StageOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success { .. })
    }
}

/// Run `op` under `policy`, bounding each attempt by `per_attempt`.
///
/// `op` receives the 1-based attempt number and must be safe to repeat with
/// the same input.
pub async fn run_stage<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    per_attempt: Duration,
    mut op: F,
) -> StageOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let start = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut last_err: Option<StageError> = None;
    let mut timed_out = false;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            let backoff = policy.backoff(attempt - 1);
            warn!(
                "{}: retry {}/{} after {}ms",
                label,
                attempt - 1,
                max_attempts - 1,
                backoff.as_millis()
            );
            sleep(backoff).await;
        }

        match timeout(per_attempt, op(attempt)).await {
            Ok(Ok(value)) => {
                debug!("{}: succeeded on attempt {}", label, attempt);
                return StageOutcome::Success {
                    value,
                    attempts: attempt,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
            }
            Ok(Err(e)) if e.is_retryable() => {
                warn!("{}: attempt {} failed: {}", label, attempt, e);
                timed_out = false;
                last_err = Some(e);
            }
            Ok(Err(e)) => {
                warn!("{}: attempt {} failed permanently: {}", label, attempt, e);
                return StageOutcome::Failed {
                    error: e,
                    attempts: attempt,
                    timed_out: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
            }
            Err(_) => {
                warn!(
                    "{}: attempt {} timed out after {}s",
                    label,
                    attempt,
                    per_attempt.as_secs()
                );
                timed_out = true;
                last_err = Some(StageError::Retryable(format!(
                    "timed out after {}s",
                    per_attempt.as_secs()
                )));
            }
        }
    }

    let detail = last_err
        .map(|e| e.detail().to_string())
        .unwrap_or_else(|| "unknown error".to_string());

    StageOutcome::Failed {
        error: StageError::Fatal(format!(
            "retry budget exhausted after {max_attempts} attempts: {detail}"
        )),
        attempts: max_attempts,
        timed_out,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}
