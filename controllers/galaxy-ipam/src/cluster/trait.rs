//! Cluster trait

use crds::{Pool, PoolSpec, PoolStatus};
use floatingip::AppType;
use k8s_openapi::api::core::v1::{Binding, Node, Pod};
use thiserror::Error;

/// Errors returned by [`Cluster`] implementations
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The API server could not be reached or answered unexpectedly
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

impl ClusterError {
    /// Whether this is a NotFound answer
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Kubernetes operations used by the allocator
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Pod by namespace and name
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError>;

    /// All pods in the cluster
    async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError>;

    /// Node by name
    async fn get_node(&self, name: &str) -> Result<Option<Node>, ClusterError>;

    /// Desired replicas of a workload; `None` when it does not exist
    async fn workload_replicas(
        &self,
        app_type: AppType,
        namespace: &str,
        name: &str,
    ) -> Result<Option<u32>, ClusterError>;

    /// POST a Binding for a pod; `NotFound` when the pod is gone
    async fn bind_pod(&self, binding: &Binding) -> Result<(), ClusterError>;

    /// Pool by name
    async fn get_pool(&self, name: &str) -> Result<Option<Pool>, ClusterError>;

    /// Create the pool or update its spec
    async fn apply_pool(&self, name: &str, spec: PoolSpec) -> Result<(), ClusterError>;

    /// Record how many addresses the pool holds
    async fn set_pool_status(&self, name: &str, status: PoolStatus) -> Result<(), ClusterError>;

    /// Delete a pool; false when it did not exist
    async fn delete_pool(&self, name: &str) -> Result<bool, ClusterError>;
}
