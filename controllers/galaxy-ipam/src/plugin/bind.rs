//! Bind: allocate the pod's address and bind it to the node

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use floatingip::{Attr, FloatingIpError, Key, ReleasePolicy};
use k8s_openapi::api::core::v1::{Binding, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{error, info, warn};

use super::{CNI_ARGS_ANNOTATION, CniArgs, FloatingIpPlugin, PluginError, attr_of, key_of, policy_of};
use crate::cloudprovider::{AssignIpRequest, UnassignIpRequest};
use crate::cluster::ClusterError;

/// Interval between binding attempts
const BIND_RETRY: Duration = Duration::from_millis(500);

/// Time allowed for the binding to succeed
const BIND_TIMEOUT: Duration = Duration::from_secs(3);

/// Pod and node named by the scheduler's bind call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Pod uid
    pub uid: String,
    /// Target node
    pub node: String,
}

/// How the bound address was obtained, needed to undo it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Allocation {
    /// The key already held it
    Reused(Ipv4Addr),
    /// Taken over from a row reserved under the pool prefix
    Transferred(Ipv4Addr),
    /// Claimed from the free list
    Fresh(Ipv4Addr),
}

impl Allocation {
    fn ip(self) -> Ipv4Addr {
        match self {
            Self::Reused(ip) | Self::Transferred(ip) | Self::Fresh(ip) => ip,
        }
    }
}

impl FloatingIpPlugin {
    /// Allocate an address for the pod in `request.node`'s subnet and bind the pod.
    ///
    /// A failure after allocation gives the address back before returning.
    pub async fn bind(&self, request: &BindRequest) -> Result<(), PluginError> {
        let pod = self
            .cluster
            .get_pod(&request.namespace, &request.name)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("pod {}/{}", request.namespace, request.name)))?;
        if !self.wants(&pod) {
            self.post_binding(&binding(request, None)).await?;
            return Ok(());
        }

        let key = key_of(&pod)?;
        let raw = key.to_string();
        let _guard = self.pod_locks.lock(&raw).await;
        let subnet = self
            .node_subnet(&request.node)
            .await?
            .ok_or_else(|| PluginError::NoSubnet(request.node.clone()))?;
        let policy = policy_of(&pod);
        let mut attr = attr_of(&pod, &request.node);
        if attr.uid.is_empty() {
            request.uid.clone_into(&mut attr.uid);
        }

        let allocation = self.allocate(&key, &subnet, policy, &attr).await?;
        let ip = allocation.ip();
        let mut assigned = false;
        match self.finish_bind(request, &pod, ip, &mut assigned).await {
            Ok(()) => {
                info!("Bound pod {}/{} to {} with ip {}", request.namespace, request.name, request.node, ip);
                Ok(())
            }
            Err(e) => {
                let node = assigned.then_some(request.node.as_str());
                self.rollback(&key, allocation, node).await;
                Err(e)
            }
        }
    }

    async fn allocate(
        &self,
        key: &Key,
        subnet: &ipnet::Ipv4Net,
        policy: ReleasePolicy,
        attr: &Attr,
    ) -> Result<Allocation, PluginError> {
        let raw = key.to_string();
        if let Some(existing) = self.ipam.first(&raw).await? {
            let ip = existing.record.ip;
            if !existing.record.attr.uid.is_empty() && existing.record.attr.uid != attr.uid {
                return Err(PluginError::Busy(raw));
            }
            self.ipam.update_attr(&raw, ip, policy, attr).await?;
            info!("Reusing ip {} of {}", ip, raw);
            return Ok(Allocation::Reused(ip));
        }
        if key.is_deployment() && policy != ReleasePolicy::Immediate {
            let prefix = key.pool_prefix();
            match self
                .ipam
                .allocate_in_subnet_with_key(&prefix, &raw, &subnet.to_string(), policy, attr)
                .await
            {
                Ok(ip) => {
                    info!("Took reserved ip {} of {} for {}", ip, prefix, raw);
                    return Ok(Allocation::Transferred(ip));
                }
                Err(FloatingIpError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let ip = self.ipam.allocate_in_subnet(&raw, Some(subnet), policy, attr).await?;
        info!("Allocated ip {} in {} for {}", ip, subnet, raw);
        Ok(Allocation::Fresh(ip))
    }

    /// Assign through the cloud provider and post the binding; `assigned` is set once the
    /// provider holds the address for the node
    async fn finish_bind(
        &self,
        request: &BindRequest,
        pod: &Pod,
        ip: Ipv4Addr,
        assigned: &mut bool,
    ) -> Result<(), PluginError> {
        let info = self
            .ipam
            .ip_info(ip)
            .ok_or_else(|| FloatingIpError::NotFound(format!("no pool holds ip {ip}")))?;
        if let Some(cloud) = &self.cloud {
            cloud
                .assign_ip(&AssignIpRequest {
                    node_name: request.node.clone(),
                    ip_address: ip.to_string(),
                    pod_namespace: request.namespace.clone(),
                    pod_name: request.name.clone(),
                })
                .await?;
            *assigned = true;
        }
        let args = serde_json::to_string(&CniArgs::single(info)).map_err(FloatingIpError::from)?;
        let mut binding = binding(request, Some(args));
        binding.metadata.uid.clone_from(&pod.metadata.uid);
        self.post_binding(&binding).await?;
        Ok(())
    }

    /// POST the binding, retrying until [`BIND_TIMEOUT`] unless the pod is gone
    async fn post_binding(&self, binding: &Binding) -> Result<(), ClusterError> {
        let deadline = tokio::time::Instant::now() + BIND_TIMEOUT;
        loop {
            match self.cluster.bind_pod(binding).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => return Err(e),
                Err(e) => {
                    if tokio::time::Instant::now() + BIND_RETRY > deadline {
                        return Err(e);
                    }
                    warn!("Binding {:?} failed, retrying: {}", binding.metadata.name, e);
                    tokio::time::sleep(BIND_RETRY).await;
                }
            }
        }
    }

    /// Undo a failed bind. An address still attached at the cloud provider keeps its row
    /// so it is never handed to another node; resync detaches and frees it later.
    async fn rollback(&self, key: &Key, allocation: Allocation, assigned_to: Option<&str>) {
        let raw = key.to_string();
        if matches!(allocation, Allocation::Reused(_)) {
            return;
        }
        if let (Some(cloud), Some(node)) = (&self.cloud, assigned_to) {
            let request = UnassignIpRequest {
                node_name: node.to_string(),
                ip_address: allocation.ip().to_string(),
            };
            if let Err(e) = cloud.unassign_ip(&request).await {
                error!(
                    "Failed to unassign ip {} of {} from {}, keeping it allocated: {}",
                    allocation.ip(),
                    raw,
                    node,
                    e
                );
                return;
            }
        }
        let result = match allocation {
            Allocation::Reused(_) => return,
            Allocation::Fresh(ip) => self.ipam.release(&raw, ip).await,
            Allocation::Transferred(_) => self
                .ipam
                .reserve_ip(&raw, &key.pool_prefix(), &Attr::default())
                .await
                .map(|_| ()),
        };
        match result {
            Ok(()) => info!("Rolled back ip {} of {}", allocation.ip(), raw),
            Err(e) => error!("Failed to roll back ip {} of {}: {}", allocation.ip(), raw, e),
        }
    }
}

fn binding(request: &BindRequest, args: Option<String>) -> Binding {
    let annotations = args.map(|a| BTreeMap::from([(CNI_ARGS_ANNOTATION.to_string(), a)]));
    Binding {
        metadata: ObjectMeta {
            name: Some(request.name.clone()),
            namespace: Some(request.namespace.clone()),
            annotations,
            ..Default::default()
        },
        target: ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Node".to_string()),
            name: Some(request.node.clone()),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testing::*;
    use super::*;
    use crate::cloudprovider::mock::FakeCloudProvider;
    use crate::cluster::mock::{binding_node, pod};
    use floatingip::policy::RELEASE_POLICY_ANNOTATION;

    fn request(name: &str, node: &str) -> BindRequest {
        BindRequest {
            namespace: "ns".to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            node: node.to_string(),
        }
    }

    fn args_of(binding: &Binding) -> CniArgs {
        let raw = &binding.metadata.annotations.as_ref().unwrap()[CNI_ARGS_ANNOTATION];
        serde_json::from_str(raw).unwrap()
    }

    #[tokio::test]
    async fn test_bind_allocates_in_node_subnet() {
        let f = fixture().await;
        f.cluster.add_pod(pod("ns", "db-0", Some(("StatefulSet", "db")), Some(RESOURCE), &[]));

        f.plugin.bind(&request("db-0", "node-b")).await.unwrap();

        let bindings = f.cluster.bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(binding_node(&bindings[0]), "node-b");
        let args = args_of(&bindings[0]);
        assert_eq!(args.common.ipinfos[0].ip.to_string(), "10.0.80.2/24");
        assert_eq!(args.common.ipinfos[0].gateway, Ipv4Addr::new(10, 0, 80, 1));

        let row = f.backend.get(Ipv4Addr::new(10, 0, 80, 2)).unwrap();
        assert_eq!(row.key, "sts_ns_db_db-0");
        assert_eq!(row.attr, Attr::new("node-b", "uid-db-0"));
    }

    #[tokio::test]
    async fn test_bind_reuses_existing_ip() {
        let f = fixture().await;
        f.backend.put(Ipv4Addr::new(10, 0, 70, 4), "sts_ns_db_db-0", SUBNET_A);
        f.cluster.add_pod(pod("ns", "db-0", Some(("StatefulSet", "db")), Some(RESOURCE), &[]));

        f.plugin.bind(&request("db-0", "node-a")).await.unwrap();

        let args = args_of(&f.cluster.bindings()[0]);
        assert_eq!(args.common.ipinfos[0].ip.addr(), Ipv4Addr::new(10, 0, 70, 4));
        assert_eq!(args.common.ipinfos[0].vlan, 2);
        assert_eq!(f.backend.get(Ipv4Addr::new(10, 0, 70, 4)).unwrap().attr.node_name, "node-a");
    }

    #[tokio::test]
    async fn test_bind_refuses_ip_of_previous_pod() {
        let f = fixture().await;
        f.cluster.add_pod(pod("ns", "db-0", Some(("StatefulSet", "db")), Some(RESOURCE), &[]));
        f.plugin.bind(&request("db-0", "node-a")).await.unwrap();

        // same name, new uid, old pod not yet deleted
        let mut successor = pod("ns", "db-0", Some(("StatefulSet", "db")), Some(RESOURCE), &[]);
        successor.metadata.uid = Some("uid-successor".to_string());
        f.cluster.add_pod(successor);
        let err = f.plugin.bind(&request("db-0", "node-a")).await.unwrap_err();
        assert_eq!(err.to_string(), "waiting for delete event of sts_ns_db_db-0 before reuse this ip");
    }

    #[tokio::test]
    async fn test_bind_takes_reserved_row() {
        let f = fixture().await;
        f.backend.put(Ipv4Addr::new(10, 0, 70, 3), "dp_ns_web_", SUBNET_A);
        let annotations = [(RELEASE_POLICY_ANNOTATION, "immutable")];
        f.cluster.add_pod(pod("ns", "web-5f8d-1", Some(("ReplicaSet", "web-5f8d")), Some(RESOURCE), &annotations));

        f.plugin.bind(&request("web-5f8d-1", "node-a")).await.unwrap();

        let row = f.backend.get(Ipv4Addr::new(10, 0, 70, 3)).unwrap();
        assert_eq!(row.key, "dp_ns_web_web-5f8d-1");
        assert_eq!(row.policy, ReleasePolicy::Immutable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_binding_releases_fresh_ip() {
        let f = fixture().await;
        f.cluster.add_pod(pod("ns", "db-0", Some(("StatefulSet", "db")), Some(RESOURCE), &[]));
        f.cluster.fail_binds(100);

        assert!(f.plugin.bind(&request("db-0", "node-a")).await.is_err());
        assert!(f.backend.get(Ipv4Addr::new(10, 0, 70, 2)).unwrap().is_free());
        assert!(f.cluster.bindings().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_binding_retried_until_success() {
        let f = fixture().await;
        f.cluster.add_pod(pod("ns", "db-0", Some(("StatefulSet", "db")), Some(RESOURCE), &[]));
        f.cluster.fail_binds(2);

        f.plugin.bind(&request("db-0", "node-a")).await.unwrap();
        assert_eq!(f.cluster.bindings().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_binding_returns_reserved_row() {
        let f = fixture().await;
        f.backend.put(Ipv4Addr::new(10, 0, 70, 3), "dp_ns_web_", SUBNET_A);
        let annotations = [(RELEASE_POLICY_ANNOTATION, "immutable")];
        let p = pod("ns", "web-5f8d-1", Some(("ReplicaSet", "web-5f8d")), Some(RESOURCE), &annotations);
        f.cluster.add_pod(p);
        let cloud = FakeCloudProvider::new();
        cloud.reject(true);
        let plugin = Arc::try_unwrap(f.plugin).ok().unwrap().with_cloud_provider(Arc::new(cloud));

        assert!(plugin.bind(&request("web-5f8d-1", "node-a")).await.is_err());
        assert_eq!(f.backend.get(Ipv4Addr::new(10, 0, 70, 3)).unwrap().key, "dp_ns_web_");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_binding_unassigns_before_release() {
        let f = fixture().await;
        f.cluster.add_pod(pod("ns", "db-0", Some(("StatefulSet", "db")), Some(RESOURCE), &[]));
        f.cluster.fail_binds(100);
        let cloud = FakeCloudProvider::new();
        let plugin = Arc::try_unwrap(f.plugin).ok().unwrap().with_cloud_provider(Arc::new(cloud.clone()));

        assert!(plugin.bind(&request("db-0", "node-a")).await.is_err());
        assert_eq!(cloud.assigned().len(), 1);
        let unassigned = cloud.unassigned();
        assert_eq!(unassigned.len(), 1);
        assert_eq!(unassigned[0].ip_address, "10.0.70.2");
        assert_eq!(unassigned[0].node_name, "node-a");
        assert!(f.backend.get(Ipv4Addr::new(10, 0, 70, 2)).unwrap().is_free());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_binding_keeps_ip_still_attached_in_cloud() {
        let f = fixture().await;
        f.cluster.add_pod(pod("ns", "db-0", Some(("StatefulSet", "db")), Some(RESOURCE), &[]));
        f.cluster.fail_binds(100);
        let cloud = FakeCloudProvider::new();
        cloud.reject_unassign_of("10.0.70.2");
        let plugin = Arc::try_unwrap(f.plugin).ok().unwrap().with_cloud_provider(Arc::new(cloud.clone()));

        assert!(plugin.bind(&request("db-0", "node-a")).await.is_err());
        assert!(cloud.unassigned().is_empty());
        assert_eq!(f.backend.get(Ipv4Addr::new(10, 0, 70, 2)).unwrap().key, "sts_ns_db_db-0");
    }

    #[tokio::test]
    async fn test_bind_assigns_through_cloud_provider() {
        let f = fixture().await;
        f.cluster.add_pod(pod("ns", "db-0", Some(("StatefulSet", "db")), Some(RESOURCE), &[]));
        let cloud = FakeCloudProvider::new();
        let plugin = Arc::try_unwrap(f.plugin).ok().unwrap().with_cloud_provider(Arc::new(cloud.clone()));

        plugin.bind(&request("db-0", "node-a")).await.unwrap();
        let assigned = cloud.assigned();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].ip_address, "10.0.70.2");
        assert_eq!(assigned[0].node_name, "node-a");
    }

    #[tokio::test]
    async fn test_plain_pod_bound_without_annotation() {
        let f = fixture().await;
        f.cluster.add_pod(pod("ns", "plain", None, None, &[]));
        f.plugin.bind(&request("plain", "node-c")).await.unwrap();
        assert!(f.cluster.bindings()[0].metadata.annotations.is_none());
    }

    #[tokio::test]
    async fn test_bind_on_node_without_subnet_fails() {
        let f = fixture().await;
        f.cluster.add_pod(pod("ns", "db-0", Some(("StatefulSet", "db")), Some(RESOURCE), &[]));
        let err = f.plugin.bind(&request("db-0", "node-c")).await.unwrap_err();
        assert!(matches!(err, PluginError::NoSubnet(_)));
        assert_eq!(f.plugin.ipam().by_key("").await.unwrap().len(), 5);
    }
}
