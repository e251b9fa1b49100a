//! Control plane client.
//!
//! [`ControlPlane`] is the contract sandlink needs from the sandbox REST API.
//! [`HttpControlPlane`] implements it over HTTP with reqwest; tests substitute
//! in-memory implementations.

use crate::config::{ClientConfig, SandboxConfig};
use crate::error::{CoreError, OperationError, Result};
use crate::events::{decode_event_stream, EventStream};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Attempts for idempotent calls that fail at the transport level.
const IDEMPOTENT_ATTEMPTS: u32 = 3;

/// First backoff delay between idempotent retries (doubles each attempt).
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Connect timeout for control plane requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request timeout for non-streaming calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What a [`ResourceHandle`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A sandbox environment.
    Sandbox,
    /// A snapshot of a sandbox.
    Snapshot,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sandbox => write!(f, "sandbox"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Body returned by every mutating call that starts asynchronous work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedOperation {
    /// Server-assigned resource id, used for heartbeat and delete.
    pub resource_id: String,
    /// Token identifying this call's event stream.
    pub correlation_id: String,
    /// Public identifier used to address the sandbox through the tunnel proxy.
    pub public_id: String,
}

/// Handle to a server-side resource with an operation in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    /// Server-assigned resource id.
    pub resource_id: String,
    /// Correlation id of the call that produced this handle.
    pub correlation_id: String,
    /// Public id for tunnel credentials.
    pub public_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// When the handle was obtained.
    pub created_at: DateTime<Utc>,
}

impl ResourceHandle {
    /// Build a handle from an accepted operation.
    pub fn new(accepted: AcceptedOperation, kind: ResourceKind) -> Self {
        Self {
            resource_id: accepted.resource_id,
            correlation_id: accepted.correlation_id,
            public_id: accepted.public_id,
            kind,
            created_at: Utc::now(),
        }
    }
}

/// Operations sandlink consumes from the sandbox REST API.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Start creating a sandbox. Never retried.
    async fn create_sandbox(&self, config: &SandboxConfig) -> Result<AcceptedOperation>;

    /// Start snapshotting a sandbox.
    async fn create_snapshot(&self, resource_id: &str, name: &str) -> Result<AcceptedOperation>;

    /// Delete a sandbox. A resource that is already gone is not an error.
    async fn delete_sandbox(&self, resource_id: &str) -> Result<()>;

    /// Send one keep-alive for a resource.
    async fn heartbeat(&self, resource_id: &str) -> Result<()>;

    /// Open the event stream of an operation.
    async fn subscribe(&self, correlation_id: &str) -> std::result::Result<EventStream, OperationError>;
}

#[derive(Debug, Serialize)]
struct SnapshotRequest<'a> {
    name: &'a str,
}

/// [`ControlPlane`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpControlPlane {
    /// Create a client for the given API base URL.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Create a client from loaded configuration.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(config.api_url.clone(), config.api_key.clone())
    }

    /// API base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn accepted(&self, response: reqwest::Response) -> Result<AcceptedOperation> {
        let response = check_status(response).await?;
        let body = response.text().await?;
        tracing::trace!(body = %body, "Accepted operation response");
        Ok(serde_json::from_str(&body)?)
    }

    async fn delete_once(&self, resource_id: &str) -> Result<()> {
        let response = self
            .authorize(self.client.delete(self.url(&format!("/sandboxes/{resource_id}"))))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(resource_id = %resource_id, "Sandbox already deleted");
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .ok()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string());
    Err(CoreError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn create_sandbox(&self, config: &SandboxConfig) -> Result<AcceptedOperation> {
        tracing::debug!(template = %config.template, "Requesting sandbox creation");
        let response = self
            .authorize(self.client.post(self.url("/sandboxes")))
            .timeout(REQUEST_TIMEOUT)
            .json(config)
            .send()
            .await?;
        self.accepted(response).await
    }

    async fn create_snapshot(&self, resource_id: &str, name: &str) -> Result<AcceptedOperation> {
        tracing::debug!(resource_id = %resource_id, name = %name, "Requesting snapshot");
        let response = self
            .authorize(
                self.client
                    .post(self.url(&format!("/sandboxes/{resource_id}/snapshots"))),
            )
            .timeout(REQUEST_TIMEOUT)
            .json(&SnapshotRequest { name })
            .send()
            .await?;
        self.accepted(response).await
    }

    async fn delete_sandbox(&self, resource_id: &str) -> Result<()> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match self.delete_once(resource_id).await {
                Err(e) if e.is_transport() && attempt < IDEMPOTENT_ATTEMPTS => {
                    tracing::debug!(
                        resource_id = %resource_id,
                        attempt,
                        error = %e,
                        "Delete failed, retrying..."
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn heartbeat(&self, resource_id: &str) -> Result<()> {
        let response = self
            .authorize(
                self.client
                    .post(self.url(&format!("/sandboxes/{resource_id}/heartbeat"))),
            )
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn subscribe(&self, correlation_id: &str) -> std::result::Result<EventStream, OperationError> {
        tracing::debug!(correlation_id = %correlation_id, "Opening event stream");
        let response = self
            .authorize(self.client.get(self.url(&format!("/events/{correlation_id}"))))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| OperationError::Transport(e.to_string()))?;

        let response = check_status(response).await.map_err(|e| match e {
            CoreError::Api { status, message } => OperationError::Api { status, message },
            other => OperationError::Transport(other.to_string()),
        })?;

        Ok(decode_event_stream(
            response.bytes_stream(),
            correlation_id.to_string(),
        ))
    }
}
