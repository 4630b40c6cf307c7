use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::cmd::SubmissionParameter;
use crate::error::{DebugError, Result};
use crate::http::{error_body, join_url, HttpClient};

/// Identifier Livy assigns to a batch on creation
pub type BatchId = u64;

/// Livy session/batch states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    NotStarted,
    Starting,
    Recovering,
    Idle,
    Running,
    Busy,
    ShuttingDown,
    Error,
    Dead,
    Killed,
    Success,
    #[serde(other)]
    Unknown,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::NotStarted => "not_started",
            BatchState::Starting => "starting",
            BatchState::Recovering => "recovering",
            BatchState::Idle => "idle",
            BatchState::Running => "running",
            BatchState::Busy => "busy",
            BatchState::ShuttingDown => "shutting_down",
            BatchState::Error => "error",
            BatchState::Dead => "dead",
            BatchState::Killed => "killed",
            BatchState::Success => "success",
            BatchState::Unknown => "unknown",
        }
    }

    /// The batch will not change state any more
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Error | BatchState::Dead | BatchState::Killed | BatchState::Success
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `POST /batches` and `GET /batches/{id}` answers
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusResponse {
    pub id: BatchId,
    pub state: BatchState,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub app_info: HashMap<String, Option<String>>,
    #[serde(default)]
    pub log: Vec<String>,
}

impl BatchStatusResponse {
    /// The cluster application id, if the scheduler allocated one yet.
    pub fn application_id(&self) -> Option<&str> {
        self.app_id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

/// Body of `GET /batches/{id}/log`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchLog {
    pub id: BatchId,
    #[serde(default)]
    pub from: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub log: Vec<String>,
}

/// The calls of the job submission service the debug pipeline needs.
///
/// Every call is a single request, retrying is left to the caller.
#[async_trait]
pub trait BatchService: Send + Sync {
    async fn create(&self, parameter: &SubmissionParameter) -> Result<BatchId>;

    async fn get_status(&self, batch_id: BatchId) -> Result<BatchStatusResponse>;

    async fn kill(&self, batch_id: BatchId) -> Result<()>;

    async fn get_log(&self, batch_id: BatchId, from: u64, size: u64) -> Result<BatchLog>;
}

/// REST client of a Livy server
#[derive(Debug, Clone)]
pub struct LivyClient {
    http: HttpClient,
    endpoint: String,
}

impl LivyClient {
    pub fn new(http: HttpClient, endpoint: String) -> Self {
        Self { http, endpoint }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.endpoint, path)
    }
}

#[async_trait]
impl BatchService for LivyClient {
    async fn create(&self, parameter: &SubmissionParameter) -> Result<BatchId> {
        let url = self.url("batches");
        let body = parameter.to_batch_request();
        tracing::debug!("Submitting batch to {}: {}", url, body);

        let request = self.http.request(Method::POST, &url).json(&body);
        let response = self.http.send(request, &url).await?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(DebugError::Submission(format!("HTTP {}: {}", status, body)));
        }

        let batch = response
            .json::<BatchStatusResponse>()
            .await
            .map_err(|err| DebugError::Submission(format!("malformed response: {}", err)))?;
        tracing::info!(batch_id = batch.id, state = %batch.state, "Batch created");
        Ok(batch.id)
    }

    async fn get_status(&self, batch_id: BatchId) -> Result<BatchStatusResponse> {
        let url = self.url(&format!("batches/{}", batch_id));
        self.http.get_json::<BatchStatusResponse>(&url).await
    }

    async fn kill(&self, batch_id: BatchId) -> Result<()> {
        let url = self.url(&format!("batches/{}", batch_id));
        let request = self.http.request(Method::DELETE, &url);
        let response = self
            .http
            .send(request, &url)
            .await
            .map_err(|err| DebugError::Kill {
                batch_id,
                reason: err.to_string(),
            })?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                tracing::info!(batch_id, "Batch killed");
                Ok(())
            }
            status => {
                let body = error_body(response).await;
                Err(DebugError::Kill {
                    batch_id,
                    reason: format!("HTTP {}: {}", status, body),
                })
            }
        }
    }

    async fn get_log(&self, batch_id: BatchId, from: u64, size: u64) -> Result<BatchLog> {
        let url = self.url(&format!("batches/{}/log?from={}&size={}", batch_id, from, size));
        self.http.get_json::<BatchLog>(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_without_app_id() {
        let status: BatchStatusResponse = serde_json::from_value(json!({
            "id": 12,
            "state": "starting",
            "appId": null,
            "appInfo": { "driverLogUrl": null, "sparkUiUrl": null },
            "log": ["stdout: ", "\nstderr: "],
        }))
        .unwrap();
        assert_eq!(status.id, 12);
        assert_eq!(status.state, BatchState::Starting);
        assert_eq!(status.application_id(), None);
    }

    #[test]
    fn blank_app_id_is_not_allocated() {
        let status: BatchStatusResponse =
            serde_json::from_value(json!({ "id": 1, "state": "running", "appId": "  " })).unwrap();
        assert_eq!(status.application_id(), None);

        let status: BatchStatusResponse = serde_json::from_value(
            json!({ "id": 1, "state": "running", "appId": "application_1700000000000_0042" }),
        )
        .unwrap();
        assert_eq!(
            status.application_id(),
            Some("application_1700000000000_0042")
        );
    }

    #[test]
    fn unknown_states_do_not_fail_decoding() {
        let status: BatchStatusResponse =
            serde_json::from_value(json!({ "id": 3, "state": "starting_up_v2" })).unwrap();
        assert_eq!(status.state, BatchState::Unknown);
        assert!(!status.state.is_terminal());
    }

    #[test]
    fn terminal_states() {
        for state in [
            BatchState::Error,
            BatchState::Dead,
            BatchState::Killed,
            BatchState::Success,
        ] {
            assert!(state.is_terminal(), "{state} should be terminal");
        }
        for state in [
            BatchState::NotStarted,
            BatchState::Starting,
            BatchState::Running,
            BatchState::ShuttingDown,
        ] {
            assert!(!state.is_terminal(), "{state} should not be terminal");
        }
    }

    #[test]
    fn state_names_match_the_wire_format() {
        assert_eq!(
            serde_json::to_value(BatchState::ShuttingDown).unwrap(),
            json!(BatchState::ShuttingDown.as_str())
        );
        assert_eq!(BatchState::NotStarted.to_string(), "not_started");
    }
}
