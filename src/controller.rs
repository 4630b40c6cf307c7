use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::{current_attempt, AppAttempt, YarnService};
use crate::cmd::SubmissionParameter;
use crate::driver::{resolve_endpoint, DebugEndpoint, DriverLogSource};
use crate::error::{DebugError, PipelineError, Stage};
use crate::livy::{BatchId, BatchService};
use crate::poll::{poll_application_id, retry_not_ready, RetryPolicy};

/// Retry budgets of the polling stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// application id polling, see [`crate::poll::resolve_application_id`]
    pub app_id_retry: RetryPolicy,
    /// waiting for the first application attempt
    pub attempt_retry: RetryPolicy,
    /// waiting for the driver to announce its debug port
    pub endpoint_retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            app_id_retry: RetryPolicy::from_secs(10, 3),
            attempt_retry: RetryPolicy::from_secs(3, 10),
            endpoint_retry: RetryPolicy::from_secs(3, 20),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Submitting,
    ResolvingApplication {
        batch_id: BatchId,
    },
    ResolvingAttempt {
        batch_id: BatchId,
        app_id: String,
    },
    ResolvingEndpoint {
        batch_id: BatchId,
        app_id: String,
        attempt_id: String,
    },
    Ready(DebugEndpoint),
    Failed {
        stage: Stage,
        attempts: u32,
        message: String,
    },
    Killed,
}

impl ControllerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControllerState::Ready(_) | ControllerState::Failed { .. } | ControllerState::Killed
        )
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "idle"),
            ControllerState::Submitting => write!(f, "submitting batch"),
            ControllerState::ResolvingApplication { batch_id } => {
                write!(f, "batch {}: waiting for an application id", batch_id)
            }
            ControllerState::ResolvingAttempt { batch_id, app_id } => {
                write!(f, "batch {}: waiting for an attempt of {}", batch_id, app_id)
            }
            ControllerState::ResolvingEndpoint {
                batch_id,
                attempt_id,
                ..
            } => write!(
                f,
                "batch {}: waiting for the driver of {} to listen",
                batch_id, attempt_id
            ),
            ControllerState::Ready(endpoint) => write!(f, "ready at {}", endpoint),
            ControllerState::Failed {
                stage,
                attempts,
                message,
            } => write!(
                f,
                "failed at `{}` after {} attempt(s): {}",
                stage, attempts, message
            ),
            ControllerState::Killed => write!(f, "killed"),
        }
    }
}

#[derive(Debug, Default)]
struct BatchSlot {
    id: Option<BatchId>,
    kill_sent: bool,
}

/// Submits one debug-enabled batch and resolves where its driver listens.
///
/// One controller runs one pipeline: `submit` -> application id -> current
/// attempt -> driver endpoint. Stages run strictly in sequence, `kill` may be
/// called from any other task and stops all further polling.
pub struct RemoteDebugJobController {
    batches: Arc<dyn BatchService>,
    yarn: Arc<dyn YarnService>,
    logs: Arc<dyn DriverLogSource>,
    settings: PipelineSettings,

    cancel: CancellationToken,
    state: watch::Sender<ControllerState>,
    batch: Mutex<BatchSlot>,
}

impl RemoteDebugJobController {
    pub fn new(
        batches: Arc<dyn BatchService>,
        yarn: Arc<dyn YarnService>,
        logs: Arc<dyn DriverLogSource>,
        settings: PipelineSettings,
    ) -> Self {
        let (state, _) = watch::channel(ControllerState::Idle);
        Self {
            batches,
            yarn,
            logs,
            settings,
            cancel: CancellationToken::new(),
            state,
            batch: Mutex::new(BatchSlot::default()),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn state(&self) -> ControllerState {
        self.state.borrow().clone()
    }

    /// Receives every state change, the last one is always terminal
    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    pub async fn batch_id(&self) -> Option<BatchId> {
        self.batch.lock().await.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs the pipeline on a background task.
    pub fn spawn(
        self: &Arc<Self>,
        base: SubmissionParameter,
    ) -> JoinHandle<Result<DebugEndpoint, PipelineError>> {
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.submit(&base).await })
    }

    /// Submits `base` with debugging enabled and waits for the driver endpoint.
    pub async fn submit(&self, base: &SubmissionParameter) -> Result<DebugEndpoint, PipelineError> {
        let started = self.state.send_if_modified(|state| {
            if *state == ControllerState::Idle {
                *state = ControllerState::Submitting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(if self.cancel.is_cancelled() {
                PipelineError::Killed
            } else {
                PipelineError::AlreadyStarted
            });
        }

        let result = self.run(base).await;
        match &result {
            Ok(endpoint) => {
                tracing::info!(%endpoint, "Driver debug endpoint resolved");
                self.transition(ControllerState::Ready(endpoint.clone()));
            }
            Err(PipelineError::Failed {
                stage,
                attempts,
                source,
            }) => {
                tracing::error!(%stage, attempts, "Debug pipeline failed: {}", source);
                self.transition(ControllerState::Failed {
                    stage: *stage,
                    attempts: *attempts,
                    message: source.to_string(),
                });
            }
            Err(PipelineError::Killed) => {
                tracing::info!("Debug pipeline stopped after kill");
            }
            Err(PipelineError::AlreadyStarted) => {}
        }
        result
    }

    /// Stops the pipeline and kills the batch if one was created.
    ///
    /// Polling stops immediately, a delayed retry that wakes up afterwards
    /// makes no further calls. The remote kill is sent at most once. After
    /// the pipeline finished the batch is still killed, but the state keeps
    /// reporting how the pipeline ended.
    pub async fn kill(&self) -> Result<(), DebugError> {
        self.cancel.cancel();
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = ControllerState::Killed;
                true
            }
        });

        let batch_id = {
            let mut slot = self.batch.lock().await;
            match slot.id {
                Some(id) if !slot.kill_sent => {
                    slot.kill_sent = true;
                    Some(id)
                }
                _ => None,
            }
        };

        match batch_id {
            Some(batch_id) => {
                tracing::info!(batch_id, "Killing batch");
                self.batches
                    .kill(batch_id)
                    .await
                    .inspect_err(|err| tracing::warn!("{}", err))
            }
            None => Ok(()),
        }
    }

    async fn run(&self, base: &SubmissionParameter) -> Result<DebugEndpoint, PipelineError> {
        let debug = base
            .to_debug_parameter()
            .map_err(|source| failed(Stage::Configure, 1, source))?;

        // Not cancellable, a batch created after a kill must still be killed
        let batch_id = self
            .batches
            .create(&debug)
            .await
            .map_err(|source| failed(Stage::Submit, 1, source))?;
        self.record_batch(batch_id).await?;

        self.transition(ControllerState::ResolvingApplication { batch_id });
        let app_id = self
            .cancellable(async {
                let mut calls = 0;
                poll_application_id(
                    self.batches.as_ref(),
                    batch_id,
                    &self.settings.app_id_retry,
                    &mut calls,
                )
                .await
                .map_err(|source| failed(Stage::ApplicationId, calls, source))
            })
            .await?;

        self.transition(ControllerState::ResolvingAttempt {
            batch_id,
            app_id: app_id.clone(),
        });
        let yarn = self.yarn.as_ref();
        let app = app_id.as_str();
        let attempt = self
            .cancellable(retry_not_ready(
                &self.settings.attempt_retry,
                Stage::Attempt,
                move |_| current_attempt(yarn, app),
            ))
            .await?;

        self.transition(ControllerState::ResolvingEndpoint {
            batch_id,
            app_id: app_id.clone(),
            attempt_id: attempt.attempt_id().to_string(),
        });
        let logs = self.logs.as_ref();
        let first = &attempt;
        self.cancellable(retry_not_ready(
            &self.settings.endpoint_retry,
            Stage::Endpoint,
            move |n| async move {
                // the attempt metadata lags behind the container, re-read it
                let attempt = if n == 1 {
                    first.clone()
                } else {
                    refresh_attempt(yarn, app, first).await?
                };
                resolve_endpoint(&attempt, logs).await
            },
        ))
        .await
    }

    /// Stores the created batch, killing it right away if a kill raced the
    /// creation.
    async fn record_batch(&self, batch_id: BatchId) -> Result<(), PipelineError> {
        let send_kill = {
            let mut slot = self.batch.lock().await;
            slot.id = Some(batch_id);
            if self.cancel.is_cancelled() && !slot.kill_sent {
                slot.kill_sent = true;
                true
            } else {
                false
            }
        };

        if send_kill {
            tracing::info!(batch_id, "Killing batch created after kill request");
            if let Err(err) = self.batches.kill(batch_id).await {
                tracing::warn!("{}", err);
            }
        }
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Killed);
        }
        Ok(())
    }

    async fn cancellable<T>(
        &self,
        stage: impl Future<Output = Result<T, PipelineError>>,
    ) -> Result<T, PipelineError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Killed),
            result = stage => result,
        }
    }

    /// Pipeline transitions never leave a terminal state
    fn transition(&self, next: ControllerState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                tracing::debug!("{} -> {}", state, next);
                *state = next;
                true
            }
        });
    }
}

async fn refresh_attempt(
    yarn: &dyn YarnService,
    app_id: &str,
    previous: &AppAttempt,
) -> Result<AppAttempt, DebugError> {
    match current_attempt(yarn, app_id).await {
        Ok(attempt) => {
            if attempt.attempt_id() != previous.attempt_id() {
                tracing::info!(
                    app_id,
                    "Attempt {} superseded by {}",
                    previous.attempt_id(),
                    attempt.attempt_id()
                );
            }
            Ok(attempt)
        }
        Err(DebugError::NoAttempt { .. }) => Ok(previous.clone()),
        Err(err) => Err(err),
    }
}

fn failed(stage: Stage, attempts: u32, source: DebugError) -> PipelineError {
    PipelineError::Failed {
        stage,
        attempts,
        source,
    }
}
