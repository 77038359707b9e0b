//! HTTP implementation of the node-facing control plane.

use async_trait::async_trait;
use fleet_core::{
    ControlPlane, NodeId, PullEnvelope, PullRequest, PullResponse, PushAck, PushRequest, Result,
    SyncError,
};
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Path of the config pull endpoint
pub const PULL_PATH: &str = "v1/node/config";

/// Path of the traffic push endpoint
pub const PUSH_PATH: &str = "v1/node/traffic";

/// Transport-level timeout; the scheduler applies its own tighter deadline
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Control plane reached over HTTP
#[derive(Clone)]
pub struct HttpControlPlane {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: HttpClient,
    pull_url: Url,
    push_url: Url,
    timeout: Duration,
}

impl HttpControlPlane {
    /// Create a client for the control plane at `base_url` with default settings
    pub fn new(base_url: &str) -> Result<Self> {
        HttpControlPlaneBuilder::new(base_url).build()
    }

    /// Create a builder for custom configuration
    #[must_use]
    pub fn builder(base_url: impl Into<String>) -> HttpControlPlaneBuilder {
        HttpControlPlaneBuilder::new(base_url)
    }

    /// Perform a POST request with JSON body
    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        url: &Url,
        node_id: NodeId,
        body: &B,
    ) -> Result<T> {
        debug!(url = %url, node_id, "POST request");

        let response = self
            .inner
            .http
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(e))?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| SyncError::MalformedPayload(e.to_string()))
        } else {
            Err(status_error(status.as_u16(), node_id, &text))
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(u64::try_from(self.inner.timeout.as_millis()).unwrap_or(u64::MAX))
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
        let envelope: PullEnvelope = self
            .post(&self.inner.pull_url, request.node_id, &request)
            .await?;
        PullResponse::try_from(envelope)
    }

    async fn push(&self, request: PushRequest) -> Result<PushAck> {
        self.post(&self.inner.push_url, request.node_id, &request)
            .await
    }
}

/// Builder for configuring an [`HttpControlPlane`]
pub struct HttpControlPlaneBuilder {
    base_url: String,
    timeout: Duration,
    user_agent: String,
}

impl HttpControlPlaneBuilder {
    /// Create a new builder for the control plane at `base_url`
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            user_agent: format!("fleet-node/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Set the transport timeout
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the User-Agent header
    #[must_use]
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    /// Build the client
    pub fn build(self) -> Result<HttpControlPlane> {
        // Join relative to the base as a directory, so a base path survives.
        let mut base = self.base_url;
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)
            .map_err(|e| SyncError::SchemaViolation(format!("invalid control plane URL: {e}")))?;
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| SyncError::SchemaViolation(format!("invalid endpoint URL: {e}")))
        };

        let http = HttpClient::builder()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .gzip(true)
            .build()
            .map_err(|e| SyncError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(HttpControlPlane {
            inner: Arc::new(ClientInner {
                http,
                pull_url: join(PULL_PATH)?,
                push_url: join(PUSH_PATH)?,
                timeout: self.timeout,
            }),
        })
    }
}

/// Convert an error response to a [`SyncError`]
fn status_error(status: u16, node_id: NodeId, body: &str) -> SyncError {
    // Try to parse error message from JSON
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| body.to_string());

    match status {
        401 | 403 => SyncError::Auth { node_id },
        404 => SyncError::NotFound { node_id },
        400 | 422 => SyncError::SchemaViolation(message),
        _ => {
            warn!(status, node_id, "control plane returned an error");
            SyncError::Network(format!("HTTP {status}: {message}"))
        }
    }
}
