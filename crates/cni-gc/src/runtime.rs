//! Container runtime access

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{GcError, RuntimeError};

/// The subset of container state the reaper looks at
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerState {
    /// Container id
    pub id: String,
    /// Runtime status such as `running` or `exited`
    pub status: String,
}

/// Container inspection
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Inspect `id`. Implementations must bound the call with a deadline.
    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError>;
}

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "Id", default)]
    id: String,
    #[serde(rename = "State", default)]
    state: Option<InspectState>,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status", default)]
    status: String,
}

/// Docker Engine API client (`GET /containers/{id}/json`)
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: reqwest::Client,
    endpoint: String,
}

impl DockerRuntime {
    /// Client for `endpoint` with a per-request `timeout`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, GcError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let url = format!("{}/containers/{id}/json", self.endpoint);
        debug!("Inspecting container {}", id);
        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                RuntimeError::DeadlineExceeded(id.to_string())
            } else {
                RuntimeError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Unavailable(format!("{status} - {body}")));
        }
        let inspected: InspectResponse = response
            .json()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(ContainerState {
            id: inspected.id,
            status: inspected.state.map(|s| s.status).unwrap_or_default(),
        })
    }
}
