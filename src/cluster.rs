use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{DebugError, Result};
use crate::http::{join_url, HttpClient};

/// One execution attempt of a YARN application
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppAttempt {
    /// the attempt sequence number, `1` for the first attempt
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub app_attempt_id: Option<String>,
    #[serde(default)]
    pub container_id: Option<String>,
    /// host:port of the node running the application master (and the driver,
    /// in cluster deploy mode)
    #[serde(default)]
    pub node_http_address: Option<String>,
    /// older resource managers name the address this way, some report both
    #[serde(default)]
    pub am_host_http_address: Option<String>,
    /// the container log page of the application master
    #[serde(default)]
    pub logs_link: Option<String>,
    #[serde(default)]
    pub am_container_logs: Option<String>,
    #[serde(default)]
    pub start_time: Option<i64>,
}

impl AppAttempt {
    /// The most specific identifier available, for messages
    pub fn attempt_id(&self) -> &str {
        self.app_attempt_id.as_deref().unwrap_or(&self.id)
    }

    /// The application master address, `None` while the scheduler left it blank
    pub fn am_address(&self) -> Option<&str> {
        first_present(&self.node_http_address, &self.am_host_http_address)
    }

    /// The container log page, `None` while the scheduler left it blank
    pub fn container_logs(&self) -> Option<&str> {
        first_present(&self.logs_link, &self.am_container_logs)
    }
}

fn first_present<'a>(
    preferred: &'a Option<String>,
    fallback: &'a Option<String>,
) -> Option<&'a str> {
    [preferred, fallback]
        .into_iter()
        .filter_map(|value| value.as_deref().map(str::trim))
        .find(|value| !value.is_empty())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppAttemptsResponse {
    #[serde(default)]
    app_attempts: Option<AppAttemptList>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppAttemptList {
    #[serde(default)]
    app_attempt: Vec<AppAttempt>,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// The part of the cluster scheduler REST API used to locate the driver.
#[async_trait]
pub trait YarnService: Send + Sync {
    /// All attempts of `app_id`, in the order the scheduler reports them
    async fn app_attempts(&self, app_id: &str) -> Result<Vec<AppAttempt>>;
}

/// REST client of a YARN resource manager
#[derive(Debug, Clone)]
pub struct YarnClient {
    http: HttpClient,
    endpoint: String,
}

impl YarnClient {
    pub fn new(http: HttpClient, endpoint: String) -> Self {
        Self { http, endpoint }
    }
}

#[async_trait]
impl YarnService for YarnClient {
    async fn app_attempts(&self, app_id: &str) -> Result<Vec<AppAttempt>> {
        let url = join_url(
            &self.endpoint,
            &format!("ws/v1/cluster/apps/{}/appattempts", app_id),
        );
        let response = self.http.get_json::<AppAttemptsResponse>(&url).await?;
        Ok(response
            .app_attempts
            .map(|list| list.app_attempt)
            .unwrap_or_default())
    }
}

/// Get the current attempt of an application through the YARN REST api.
///
/// YARN lists attempts chronologically and a superseding attempt is appended,
/// so the current attempt is the last one. An empty list means the application
/// is registered but its master container is not scheduled yet.
pub async fn current_attempt(yarn: &dyn YarnService, app_id: &str) -> Result<AppAttempt> {
    let attempts = yarn.app_attempts(app_id).await?;
    tracing::debug!(app_id, count = attempts.len(), "Listed application attempts");

    attempts
        .into_iter()
        .last()
        .ok_or_else(|| DebugError::NoAttempt {
            app_id: app_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedAttempts(Vec<AppAttempt>);

    #[async_trait]
    impl YarnService for FixedAttempts {
        async fn app_attempts(&self, _app_id: &str) -> Result<Vec<AppAttempt>> {
            Ok(self.0.clone())
        }
    }

    fn attempt(id: &str, address: &str) -> AppAttempt {
        AppAttempt {
            id: id.to_string(),
            node_http_address: Some(address.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn current_attempt_is_the_last_one() {
        let yarn = FixedAttempts(vec![
            attempt("1", "10.0.0.4:8042"),
            attempt("2", "10.0.0.5:8042"),
        ]);
        let current = current_attempt(&yarn, "application_1_0001").await.unwrap();
        assert_eq!(current.id, "2");
        assert_eq!(current.am_address(), Some("10.0.0.5:8042"));
    }

    #[tokio::test]
    async fn no_attempt_yet() {
        let yarn = FixedAttempts(vec![]);
        let err = current_attempt(&yarn, "application_1_0001")
            .await
            .unwrap_err();
        assert!(matches!(err, DebugError::NoAttempt { ref app_id } if app_id == "application_1_0001"));
        assert!(err.is_retryable());
    }

    #[test]
    fn decodes_resource_manager_listing() {
        let response: AppAttemptsResponse = serde_json::from_value(json!({
            "appAttempts": {
                "appAttempt": [{
                    "id": 1,
                    "startTime": 1700000000000i64,
                    "containerId": "container_1700000000000_0042_01_000001",
                    "nodeHttpAddress": "wn0.cluster:30060",
                    "nodeId": "wn0.cluster:30050",
                    "logsLink": "http://wn0.cluster:30060/node/containerlogs/container_1700000000000_0042_01_000001/livy",
                    "blacklistedNodes": "",
                    "appAttemptId": "appattempt_1700000000000_0042_000001"
                }]
            }
        }))
        .unwrap();

        let attempts = response.app_attempts.unwrap().app_attempt;
        assert_eq!(attempts.len(), 1);
        let attempt = &attempts[0];
        assert_eq!(attempt.id, "1");
        assert_eq!(attempt.attempt_id(), "appattempt_1700000000000_0042_000001");
        assert_eq!(attempt.am_address(), Some("wn0.cluster:30060"));
        assert!(attempt.container_logs().unwrap().contains("containerlogs"));
    }

    #[test]
    fn decodes_am_host_field_names() {
        let attempt: AppAttempt = serde_json::from_value(json!({
            "id": "appattempt_1_0001_000002",
            "amHostHttpAddress": "10.0.0.5:41230",
            "amContainerLogs": "http://10.0.0.5:8042/node/containerlogs/container_1/livy",
        }))
        .unwrap();
        assert_eq!(attempt.attempt_id(), "appattempt_1_0001_000002");
        assert_eq!(attempt.am_address(), Some("10.0.0.5:41230"));
        assert_eq!(
            attempt.container_logs(),
            Some("http://10.0.0.5:8042/node/containerlogs/container_1/livy")
        );
    }

    #[test]
    fn decodes_attempt_reporting_both_field_names() {
        let attempt: AppAttempt = serde_json::from_value(json!({
            "id": 2,
            "nodeHttpAddress": "wn1.cluster:30060",
            "amHostHttpAddress": "wn1.internal:30060",
            "logsLink": "http://wn1.cluster:30060/node/containerlogs/container_02_000001/livy",
            "amContainerLogs": "http://wn1.internal:30060/node/containerlogs/container_02_000001/livy",
        }))
        .unwrap();
        assert_eq!(attempt.am_address(), Some("wn1.cluster:30060"));
        assert_eq!(
            attempt.container_logs(),
            Some("http://wn1.cluster:30060/node/containerlogs/container_02_000001/livy")
        );
    }

    #[test]
    fn blank_fields_fall_back_or_stay_absent() {
        let attempt: AppAttempt = serde_json::from_value(json!({
            "id": 1,
            "nodeHttpAddress": "",
            "amHostHttpAddress": "wn0.internal:30060",
            "logsLink": "",
        }))
        .unwrap();
        assert_eq!(attempt.am_address(), Some("wn0.internal:30060"));
        assert_eq!(attempt.container_logs(), None);
    }

    #[test]
    fn empty_listing() {
        let response: AppAttemptsResponse =
            serde_json::from_value(json!({ "appAttempts": null })).unwrap();
        assert!(response.app_attempts.is_none());
    }
}
