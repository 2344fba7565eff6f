//! Kubernetes access
//!
//! Everything the allocator reads from or writes to the API server goes through the
//! [`Cluster`] trait so plugin and API logic can run against an in-memory fake.

#[path = "trait.rs"]
pub mod cluster_trait;
pub mod kube;
#[cfg(test)]
pub mod mock;

use k8s_openapi::api::core::v1::{Node, Pod};

pub use self::cluster_trait::{Cluster, ClusterError};
pub use self::kube::KubeCluster;

/// First InternalIP of a node
pub fn node_internal_ip(node: &Node) -> Option<std::net::Ipv4Addr> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .and_then(|a| a.address.parse().ok())
}

/// `namespace/name` of a pod
pub fn pod_name(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Pod phase, empty when unknown
pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

/// Whether the pod reached a terminal phase
pub fn finished(pod: &Pod) -> bool {
    matches!(pod_phase(pod), "Succeeded" | "Failed")
}

/// Whether the pod was evicted
pub fn evicted(pod: &Pod) -> bool {
    pod_phase(pod) == "Failed"
        && pod.status.as_ref().and_then(|s| s.reason.as_deref()) == Some("Evicted")
}
