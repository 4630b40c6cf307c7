use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::{DebugError, PipelineError, Result, Stage};
use crate::livy::{BatchId, BatchService};

/// Delay between attempts and the total number of attempts of one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    delay: Duration,
    max_retries: u32,
}

impl RetryPolicy {
    /// `max_retries` counts every call, including the first, and is at least 1.
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self {
            delay,
            max_retries: max_retries.max(1),
        }
    }

    pub fn from_secs(delay_secs: u64, max_retries: u32) -> Self {
        Self::new(Duration::from_secs(delay_secs), max_retries)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_secs(10, 3)
    }
}

/// Polls the batch status until the cluster scheduler allocated an application.
///
/// Only "not allocated yet" is retried. A failing status call is returned as
/// is, and a batch that already ended fails without waiting for the budget.
pub async fn resolve_application_id(
    batches: &dyn BatchService,
    batch_id: BatchId,
    policy: &RetryPolicy,
) -> Result<String> {
    let mut calls = 0;
    poll_application_id(batches, batch_id, policy, &mut calls).await
}

/// [`resolve_application_id`], reporting the number of status calls made
pub(crate) async fn poll_application_id(
    batches: &dyn BatchService,
    batch_id: BatchId,
    policy: &RetryPolicy,
    calls: &mut u32,
) -> Result<String> {
    loop {
        *calls += 1;
        let status = batches.get_status(batch_id).await?;

        if let Some(app_id) = status.application_id() {
            tracing::info!(batch_id, app_id, attempt = *calls, "Application id allocated");
            return Ok(app_id.to_string());
        }
        if status.state.is_terminal() {
            return Err(DebugError::BatchTerminated {
                batch_id,
                state: status.state,
            });
        }
        if *calls >= policy.max_retries() {
            return Err(DebugError::ApplicationNotAllocated {
                batch_id,
                attempts: *calls,
            });
        }

        tracing::debug!(
            batch_id,
            attempt = *calls,
            state = %status.state,
            "Application id not allocated yet, retrying in {:?}",
            policy.delay()
        );
        sleep(policy.delay()).await;
    }
}

/// Runs `op` until it succeeds, retrying "not ready yet" failures per `policy`.
///
/// `op` gets the 1-based attempt number. Failures are tagged with `stage` and
/// the number of attempts made.
pub async fn retry_not_ready<T, F, Fut>(
    policy: &RetryPolicy,
    stage: Stage,
    mut op: F,
) -> std::result::Result<T, PipelineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries() => {
                tracing::debug!(
                    %stage,
                    attempt,
                    "{}, retrying in {:?}",
                    err,
                    policy.delay()
                );
                sleep(policy.delay()).await;
                attempt += 1;
            }
            Err(source) => {
                return Err(PipelineError::Failed {
                    stage,
                    attempts: attempt,
                    source,
                })
            }
        }
    }
}
