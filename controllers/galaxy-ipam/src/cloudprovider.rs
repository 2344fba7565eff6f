//! Cloud provider client
//!
//! On clouds where floating IPs must be attached to a node's interface, the allocator
//! asks an external provider to assign an address to a node at bind time and to
//! unassign it when the pod goes away.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;

/// Reply message marking an address the provider does not know
pub const RESOURCE_NOT_FOUND: &str = "ResourceNotFound";

/// Per-attempt deadline
const CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors returned by a cloud provider
#[derive(Debug, Error)]
pub enum CloudError {
    /// The call did not finish within its deadline
    #[error("cloud provider call timed out: {0}")]
    DeadlineExceeded(String),

    /// Transport error
    #[error("cloud provider unreachable: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with `success: false`
    #[error("cloud provider {operation} reply failed, message {message}")]
    Rejected {
        /// `AssignIP` or `UnAssignIP`
        operation: &'static str,
        /// Provider message
        message: String,
    },
}

/// Attach `ip_address` to `node_name`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignIpRequest {
    /// Node the pod was bound to
    pub node_name: String,
    /// Address to attach
    pub ip_address: String,
    /// Pod namespace
    pub pod_namespace: String,
    /// Pod name
    pub pod_name: String,
}

/// Detach `ip_address` from `node_name`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnassignIpRequest {
    /// Node holding the address
    pub node_name: String,
    /// Address to detach
    pub ip_address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Reply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    msg: String,
}

/// Address assignment on the underlying cloud
#[async_trait::async_trait]
pub trait CloudProvider: Send + Sync {
    /// Attach an address to a node
    async fn assign_ip(&self, request: &AssignIpRequest) -> Result<(), CloudError>;

    /// Detach an address; an address unknown to the provider counts as detached
    async fn unassign_ip(&self, request: &UnassignIpRequest) -> Result<(), CloudError>;
}

/// [`CloudProvider`] speaking JSON over HTTP
#[derive(Debug, Clone)]
pub struct HttpCloudProvider {
    client: reqwest::Client,
    base_url: String,
    backoff: ExponentialBackoff,
}

impl HttpCloudProvider {
    /// Client for the provider at `addr` (`host:port` or a full URL)
    pub fn new(addr: &str) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder().timeout(CALL_TIMEOUT).build()?;
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{addr}")
        };
        Ok(Self {
            client,
            base_url,
            backoff: ExponentialBackoff::new(Duration::from_millis(10), 5.0, 4),
        })
    }

    async fn call_once<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<Reply, CloudError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                CloudError::DeadlineExceeded(url.clone())
            } else {
                CloudError::Http(e)
            }
        })?;
        Ok(response.error_for_status()?.json::<Reply>().await?)
    }

    /// Retry transport errors along the backoff schedule; a reply ends the loop
    async fn call<T: Serialize + Sync>(
        &self,
        operation: &'static str,
        path: &str,
        body: &T,
        tolerate_not_found: bool,
    ) -> Result<(), CloudError> {
        let mut backoff = self.backoff.clone();
        loop {
            let err = match self.call_once(path, body).await {
                Ok(reply) if reply.success => return Ok(()),
                Ok(reply) if tolerate_not_found && reply.msg.contains(RESOURCE_NOT_FOUND) => {
                    debug!("{} answered {}, treating as done", operation, reply.msg);
                    return Ok(());
                }
                Ok(reply) => {
                    return Err(CloudError::Rejected {
                        operation,
                        message: reply.msg,
                    });
                }
                Err(e) => e,
            };
            match backoff.next_backoff() {
                Some(delay) => {
                    warn!("{} failed, retrying in {:?}: {}", operation, delay, err);
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            }
        }
    }
}

#[async_trait::async_trait]
impl CloudProvider for HttpCloudProvider {
    async fn assign_ip(&self, request: &AssignIpRequest) -> Result<(), CloudError> {
        self.call("AssignIP", "/v1/assignip", request, false).await?;
        info!("AssignIP {} to {} success", request.ip_address, request.node_name);
        Ok(())
    }

    async fn unassign_ip(&self, request: &UnassignIpRequest) -> Result<(), CloudError> {
        self.call("UnAssignIP", "/v1/unassignip", request, true).await?;
        info!("UnAssignIP {} from {} success", request.ip_address, request.node_name);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        assert_eq!(HttpCloudProvider::new("10.0.0.1:8080").unwrap().base_url, "http://10.0.0.1:8080");
        assert_eq!(
            HttpCloudProvider::new("https://cloud.example/").unwrap().base_url,
            "https://cloud.example"
        );
    }

    #[test]
    fn test_request_wire_names() {
        let request = UnassignIpRequest {
            node_name: "node-1".to_string(),
            ip_address: "10.0.70.5".to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["nodeName"], "node-1");
        assert_eq!(value["ipAddress"], "10.0.70.5");
    }

    #[tokio::test]
    async fn test_unreachable_provider_gives_up() {
        // nothing listens on port 9 of the loopback
        let provider = HttpCloudProvider {
            backoff: ExponentialBackoff::new(Duration::from_millis(1), 1.0, 1),
            ..HttpCloudProvider::new("127.0.0.1:9").unwrap()
        };
        let request = UnassignIpRequest {
            node_name: "node-1".to_string(),
            ip_address: "10.0.70.5".to_string(),
        };
        assert!(provider.unassign_ip(&request).await.is_err());
    }
}
