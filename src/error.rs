use std::fmt;

use crate::livy::{BatchId, BatchState};

pub type Result<T> = std::result::Result<T, DebugError>;

/// Errors produced by a single stage of the debug pipeline.
///
/// The controller only looks at [`DebugError::is_retryable`] to decide between
/// retrying a stage and failing the whole pipeline.
#[derive(Debug, thiserror::Error)]
pub enum DebugError {
    #[error("invalid submission configuration: {0}")]
    Configuration(String),

    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("batch submission rejected: {0}")]
    Submission(String),

    #[error("batch {batch_id} has no application id after {attempts} attempt(s)")]
    ApplicationNotAllocated { batch_id: BatchId, attempts: u32 },

    #[error("batch {batch_id} reached state `{state}` before an application id was allocated")]
    BatchTerminated { batch_id: BatchId, state: BatchState },

    #[error("application {app_id} has no attempts yet")]
    NoAttempt { app_id: String },

    #[error("attempt {attempt_id} does not expose a logs link yet")]
    NoLogsLink { attempt_id: String },

    #[error("attempt {attempt_id} does not report an application master address yet")]
    NoAmAddress { attempt_id: String },

    #[error("no debug agent announcement found in driver log {url}")]
    PortNotFound { url: String },

    #[error("malformed application master address `{address}`")]
    MalformedAmAddress { address: String },

    #[error("failed to kill batch {batch_id}: {reason}")]
    Kill { batch_id: BatchId, reason: String },
}

impl DebugError {
    /// "Not ready yet" failures which the controller retries within a stage.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DebugError::NoAttempt { .. }
                | DebugError::NoLogsLink { .. }
                | DebugError::NoAmAddress { .. }
                | DebugError::PortNotFound { .. }
        )
    }

    pub(crate) fn transport(url: &str, err: reqwest::Error) -> Self {
        let mut reason = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            reason.push_str(": ");
            reason.push_str(&cause.to_string());
            source = cause.source();
        }
        DebugError::Transport {
            url: url.to_string(),
            reason,
        }
    }
}

/// The pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configure,
    Submit,
    ApplicationId,
    Attempt,
    Endpoint,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Configure => "configure",
            Stage::Submit => "submit",
            Stage::ApplicationId => "application-id",
            Stage::Attempt => "attempt",
            Stage::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a whole debug pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("stage `{stage}` failed after {attempts} attempt(s): {source}")]
    Failed {
        stage: Stage,
        attempts: u32,
        #[source]
        source: DebugError,
    },

    #[error("debug session was killed")]
    Killed,

    #[error("this controller already ran a debug pipeline")]
    AlreadyStarted,
}

impl PipelineError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Failed { stage, .. } => Some(*stage),
            PipelineError::Killed | PipelineError::AlreadyStarted => None,
        }
    }

    /// A one-line suggestion suitable for showing next to the error.
    pub fn hint(&self) -> String {
        let (attempts, source) = match self {
            PipelineError::Failed {
                attempts, source, ..
            } => (attempts, source),
            PipelineError::Killed => return "the batch was killed on request".to_string(),
            PipelineError::AlreadyStarted => {
                return "create a new controller for every submission".to_string()
            }
        };

        match source {
            DebugError::Configuration(_) => {
                "fix the submission's spark.driver.extraJavaOptions and resubmit".to_string()
            }
            DebugError::Transport { .. } => {
                "check that the Livy and YARN endpoints are reachable".to_string()
            }
            DebugError::Submission(_) => {
                "check the batch definition accepted by the Livy server".to_string()
            }
            DebugError::ApplicationNotAllocated { .. } => format!(
                "the cluster did not allocate an application after {} attempt(s), is it out of capacity?",
                attempts
            ),
            DebugError::BatchTerminated { .. } => {
                "the job ended before it could be debugged, inspect the batch log".to_string()
            }
            DebugError::NoAttempt { .. } => format!(
                "no application attempt was scheduled after {} attempt(s)",
                attempts
            ),
            DebugError::NoLogsLink { .. }
            | DebugError::NoAmAddress { .. }
            | DebugError::PortNotFound { .. } => format!(
                "driver did not expose a debug port after {} attempt(s), is the workload still initializing?",
                attempts
            ),
            DebugError::MalformedAmAddress { .. } => {
                "the cluster reported an unusable application master address".to_string()
            }
            DebugError::Kill { .. } => "the batch may still be running".to_string(),
        }
    }
}
