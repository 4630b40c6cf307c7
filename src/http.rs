use std::fmt::Debug;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use crate::error::{DebugError, Result};

/// Livy rejects mutating requests without this header when CSRF protection is on
pub const REQUESTED_BY_HEADER: &str = "X-Requested-By";

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Per request timeout, covers connect and body
    pub timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Value of the `X-Requested-By` header
    pub requested_by: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            username: None,
            password: None,
            requested_by: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// A cheaply clonable client, clones share one connection pool so any number
/// of controllers can use it concurrently.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    settings: HttpSettings,
}

impl HttpClient {
    pub fn new(settings: HttpSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| DebugError::transport("<client>", err))?;

        Ok(Self { client, settings })
    }

    pub(crate) fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(REQUESTED_BY_HEADER, &self.settings.requested_by);
        match &self.settings.username {
            Some(username) => builder.basic_auth(username, self.settings.password.as_ref()),
            None => builder,
        }
    }

    pub(crate) async fn send(&self, builder: RequestBuilder, url: &str) -> Result<Response> {
        tracing::trace!("Going to make a request to {}", url);
        builder
            .send()
            .await
            .map_err(|err| DebugError::transport(url, err))
            .inspect_err(|err| tracing::debug!("The http request failed: {err}"))
    }

    /// GETs `url` and decodes a JSON body, non-2xx answers are transport errors.
    pub(crate) async fn get_json<R>(&self, url: &str) -> Result<R>
    where
        R: Debug + DeserializeOwned,
    {
        let response = self.send(self.request(Method::GET, url), url).await?;
        let response = ensure_success(response, url).await?;
        response
            .json::<R>()
            .await
            .map_err(|err| DebugError::transport(url, err))
            .inspect(|data| tracing::trace!("Loaded: {data:?}"))
    }

    /// GETs `url` as plain text
    pub async fn get_text(&self, url: &str) -> Result<String> {
        let response = self.send(self.request(Method::GET, url), url).await?;
        let response = ensure_success(response, url).await?;
        response
            .text()
            .await
            .map_err(|err| DebugError::transport(url, err))
    }
}

async fn ensure_success(response: Response, url: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = error_body(response).await;
    Err(DebugError::Transport {
        url: url.to_string(),
        reason: format!("HTTP {}: {}", status, body),
    })
}

/// The (truncated) body of a failed response, for error messages.
pub(crate) async fn error_body(response: Response) -> String {
    match response.text().await {
        Ok(body) => body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect(),
        Err(err) => format!("<unreadable body: {}>", err),
    }
}

/// Joins a base endpoint and a path without doubling the slash.
pub(crate) fn join_url(endpoint: &str, path: &str) -> String {
    format!(
        "{}/{}",
        endpoint.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
