//! Floating IP scheduler plugin
//!
//! Ties the allocator to pod scheduling: [`filter`] and [`prioritize`] steer pods to
//! nodes whose subnet can serve them, [`bind`] allocates and binds, [`unbind`] applies
//! the release policy when a pod goes away, [`resync`] repairs what events missed and
//! [`events`] drives unbind from pod watch events.

pub mod bind;
pub mod events;
pub mod filter;
pub mod prioritize;
pub mod resync;
pub mod unbind;

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use floatingip::{
    Attr, FloatingIpError, IpInfo, Ipam, Key, PartitionedStore, ReleasePolicy, policy::POOL_ANNOTATION,
};
use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::{Node, Pod};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cloudprovider::{CloudError, CloudProvider};
use crate::cluster::{Cluster, ClusterError, node_internal_ip};
use crate::locks::KeyLocks;
use crate::metrics::Metrics;

/// Pod annotation carrying the allocated addresses to CNI
pub const CNI_ARGS_ANNOTATION: &str = "k8s.v1.cni.galaxy.io/args";

/// Failure reason for nodes outside every configured node subnet
pub const REASON_NO_CONFIG_NODE: &str = "FloatingIPPlugin:NoFIPConfigNode";

/// Failure reason for nodes whose subnet has no address for the pod
pub const REASON_NO_FIP_LEFT: &str = "FloatingIPPlugin:NoFIPLeft";

/// Errors returned by the scheduler plugin
#[derive(Debug, Error)]
pub enum PluginError {
    /// Allocation store error
    #[error("{0}")]
    Store(#[from] FloatingIpError),

    /// Kubernetes API error
    #[error("{0}")]
    Cluster(#[from] ClusterError),

    /// Cloud provider error
    #[error("{0}")]
    Cloud(#[from] CloudError),

    /// The workload or pool holds all the addresses it may hold
    #[error("{0}")]
    Capacity(String),

    /// The address still belongs to a previous pod with the same name
    #[error("waiting for delete event of {0} before reuse this ip")]
    Busy(String),

    /// The node is outside every configured node subnet
    #[error("node {0} has no floating ip subnet")]
    NoSubnet(String),

    /// The pod cannot be handled (no owner, unsupported owner kind)
    #[error("{0}")]
    InvalidPod(String),
}

/// `k8s.v1.cni.galaxy.io/args` annotation value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniArgs {
    /// Arguments shared by all CNI plugins
    pub common: CommonCniArgs,
}

/// `common` section of [`CniArgs`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonCniArgs {
    /// Allocated addresses
    #[serde(default)]
    pub ipinfos: Vec<IpInfo>,
}

impl CniArgs {
    /// Args naming a single address
    pub fn single(info: IpInfo) -> Self {
        Self {
            common: CommonCniArgs { ipinfos: vec![info] },
        }
    }

    /// Args of a bound pod, if it carries them
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let raw = pod.metadata.annotations.as_ref()?.get(CNI_ARGS_ANNOTATION)?;
        serde_json::from_str(raw).ok()
    }
}

/// The scheduler plugin
pub struct FloatingIpPlugin {
    ipam: Ipam,
    second: Option<Ipam>,
    store: PartitionedStore,
    cluster: Arc<dyn Cluster>,
    cloud: Option<Arc<dyn CloudProvider>>,
    metrics: Option<Metrics>,
    resource_name: String,
    node_subnets: Mutex<HashMap<String, Option<Ipv4Net>>>,
    pod_locks: KeyLocks,
    pool_locks: KeyLocks,
}

impl FloatingIpPlugin {
    /// Plugin allocating from `ipam`; `second` tables are only listed, released and resynced
    pub fn new(ipam: Ipam, second: Option<Ipam>, cluster: Arc<dyn Cluster>, resource_name: &str) -> Self {
        let mut backends = vec![ipam.backend().clone()];
        if let Some(second) = &second {
            backends.push(second.backend().clone());
        }
        Self {
            ipam,
            second,
            store: PartitionedStore::new(backends),
            cluster,
            cloud: None,
            metrics: None,
            resource_name: resource_name.to_string(),
            node_subnets: Mutex::new(HashMap::new()),
            pod_locks: KeyLocks::new(),
            pool_locks: KeyLocks::new(),
        }
    }

    /// Assign addresses through `cloud` on bind and unassign them on release
    pub fn with_cloud_provider(mut self, cloud: Arc<dyn CloudProvider>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Export counters and latencies through `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Create the tables and insert the configured pool rows.
    ///
    /// Writes to the store, so it runs only once this replica leads.
    pub async fn configure(&self) -> Result<(), FloatingIpError> {
        self.ipam.configure().await?;
        if let Some(second) = &self.second {
            second.configure().await?;
        }
        Ok(())
    }

    /// Allocator of the primary table
    pub fn ipam(&self) -> &Ipam {
        &self.ipam
    }

    /// Both tables, primary first
    pub fn store(&self) -> &PartitionedStore {
        &self.store
    }

    /// Kubernetes access
    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    /// Locks serializing work on one pool or app prefix
    pub fn pool_locks(&self) -> &KeyLocks {
        &self.pool_locks
    }

    /// Whether `pod` requests the floating IP resource
    pub fn wants(&self, pod: &Pod) -> bool {
        pod.spec.as_ref().is_some_and(|spec| {
            spec.containers.iter().any(|c| {
                c.resources.as_ref().is_some_and(|r| {
                    r.requests.as_ref().is_some_and(|m| m.contains_key(&self.resource_name))
                        || r.limits.as_ref().is_some_and(|m| m.contains_key(&self.resource_name))
                })
            })
        })
    }

    /// Record the latency of a scheduler callback
    pub fn observe_latency(&self, operation: &str, started: std::time::Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_latency(operation, started.elapsed().as_secs_f64());
        }
    }

    /// Prime the node subnet cache from a node object sent by the scheduler
    pub fn observe_node(&self, node: &Node) {
        let Some(name) = node.metadata.name.clone() else {
            return;
        };
        let subnet = node_internal_ip(node).and_then(|ip| self.ipam.node_subnet(ip));
        self.cache().insert(name, subnet);
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<Ipv4Net>>> {
        self.node_subnets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Node subnet serving `node_name`, `None` when the node is outside every pool
    pub async fn node_subnet(&self, node_name: &str) -> Result<Option<Ipv4Net>, PluginError> {
        if let Some(subnet) = self.cache().get(node_name) {
            return Ok(*subnet);
        }
        let node = self
            .cluster
            .get_node(node_name)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("node {node_name}")))?;
        let subnet = node_internal_ip(&node).and_then(|ip| self.ipam.node_subnet(ip));
        debug!("Node {} serves subnet {:?}", node_name, subnet);
        self.cache().insert(node_name.to_string(), subnet);
        Ok(subnet)
    }

    /// Recompute `galaxy_ip_counter` from both tables
    pub async fn refresh_ip_counter(&self) -> Result<(), PluginError> {
        let Some(metrics) = &self.metrics else {
            return Ok(());
        };
        let mut total: HashMap<String, usize> = HashMap::new();
        let mut allocated: HashMap<String, usize> = HashMap::new();
        for row in self.store.lookup_by_prefix("").await? {
            for subnet in row.node_subnets() {
                *total.entry(subnet.to_string()).or_default() += 1;
                if !row.is_free() {
                    *allocated.entry(subnet.to_string()).or_default() += 1;
                }
            }
        }
        for (subnet, count) in &total {
            metrics.set_ip_count("total", subnet, *count);
            metrics.set_ip_count("allocated", subnet, allocated.get(subnet).copied().unwrap_or(0));
        }
        Ok(())
    }

    /// Allocator holding `ip`, primary first
    fn ipam_for(&self, ip: Ipv4Addr) -> &Ipam {
        match &self.second {
            Some(second) if self.ipam.ip_info(ip).is_none() && second.ip_info(ip).is_some() => second,
            _ => &self.ipam,
        }
    }
}

impl fmt::Debug for FloatingIpPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FloatingIpPlugin")
            .field("ipam", &self.ipam.name())
            .field("second", &self.second.as_ref().map(Ipam::name))
            .field("resource_name", &self.resource_name)
            .field("cloud_provider", &self.cloud.is_some())
            .finish_non_exhaustive()
    }
}

/// Ownership key of `pod`
pub fn key_of(pod: &Pod) -> Result<Key, PluginError> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let owners = pod.metadata.owner_references.as_deref().unwrap_or_default();
    let owner = owners
        .iter()
        .find(|o| o.controller == Some(true))
        .or_else(|| owners.first())
        .map(|o| (o.kind.as_str(), o.name.as_str()));
    let pool = annotation(pod, POOL_ANNOTATION).unwrap_or_default();
    Key::from_owner(owner, namespace, name, pool).map_err(|e| PluginError::InvalidPod(e.to_string()))
}

/// Release policy requested by `pod`
pub fn policy_of(pod: &Pod) -> ReleasePolicy {
    pod.metadata
        .annotations
        .as_ref()
        .map_or(ReleasePolicy::Immediate, ReleasePolicy::from_annotations)
}

/// Attributes stored for `pod` bound to `node_name`
pub fn attr_of(pod: &Pod, node_name: &str) -> Attr {
    Attr::new(node_name, pod.metadata.uid.as_deref().unwrap_or_default())
}

fn annotation<'a>(pod: &'a Pod, name: &str) -> Option<&'a str> {
    pod.metadata.annotations.as_ref()?.get(name).map(String::as_str)
}
