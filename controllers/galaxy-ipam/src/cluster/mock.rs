//! In-memory cluster for tests

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crds::{Pool, PoolSpec, PoolStatus};
use floatingip::AppType;
use k8s_openapi::api::core::v1::{
    Binding, Node, NodeAddress, NodeStatus, ObjectReference, Pod, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use super::cluster_trait::{Cluster, ClusterError};

#[derive(Default)]
struct State {
    pods: BTreeMap<(String, String), Pod>,
    nodes: BTreeMap<String, Node>,
    workloads: HashMap<(AppType, String, String), u32>,
    pools: BTreeMap<String, PoolSpec>,
    pool_status: BTreeMap<String, PoolStatus>,
    bindings: Vec<Binding>,
    bind_failures: u32,
    unavailable: bool,
}

/// Fake [`Cluster`] keeping objects in maps
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_pod(&self, pod: Pod) {
        let key = (
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        self.lock().pods.insert(key, pod);
    }

    pub fn add_node(&self, name: &str, internal_ip: &str) {
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: internal_ip.to_string(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.lock().nodes.insert(name.to_string(), node);
    }

    pub fn set_replicas(&self, app_type: AppType, namespace: &str, name: &str, replicas: u32) {
        self.lock()
            .workloads
            .insert((app_type, namespace.to_string(), name.to_string()), replicas);
    }

    /// Fail the next `n` bind calls with an unavailable error
    pub fn fail_binds(&self, n: u32) {
        self.lock().bind_failures = n;
    }

    /// Make every call fail with an unavailable error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.lock().bindings.clone()
    }

    pub fn pool(&self, name: &str) -> Option<PoolSpec> {
        self.lock().pools.get(name).cloned()
    }

    pub fn pool_status(&self, name: &str) -> Option<PoolStatus> {
        self.lock().pool_status.get(name).cloned()
    }

    fn checked(&self) -> Result<std::sync::MutexGuard<'_, State>, ClusterError> {
        let state = self.lock();
        if state.unavailable {
            return Err(ClusterError::Unavailable("fake cluster unavailable".to_string()));
        }
        Ok(state)
    }
}

#[async_trait::async_trait]
impl Cluster for FakeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        Ok(self
            .checked()?
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError> {
        Ok(self.checked()?.pods.values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, ClusterError> {
        Ok(self.checked()?.nodes.get(name).cloned())
    }

    async fn workload_replicas(
        &self,
        app_type: AppType,
        namespace: &str,
        name: &str,
    ) -> Result<Option<u32>, ClusterError> {
        Ok(self
            .checked()?
            .workloads
            .get(&(app_type, namespace.to_string(), name.to_string()))
            .copied())
    }

    async fn bind_pod(&self, binding: &Binding) -> Result<(), ClusterError> {
        let mut state = self.checked()?;
        if state.bind_failures > 0 {
            state.bind_failures -= 1;
            return Err(ClusterError::Unavailable("bind refused".to_string()));
        }
        let key = (
            binding.metadata.namespace.clone().unwrap_or_default(),
            binding.metadata.name.clone().unwrap_or_default(),
        );
        if !state.pods.contains_key(&key) {
            return Err(ClusterError::NotFound(format!("pod {}/{}", key.0, key.1)));
        }
        state.bindings.push(binding.clone());
        Ok(())
    }

    async fn get_pool(&self, name: &str) -> Result<Option<Pool>, ClusterError> {
        Ok(self
            .checked()?
            .pools
            .get(name)
            .map(|spec| Pool::named(name, spec.size, spec.pre_allocate_ip)))
    }

    async fn apply_pool(&self, name: &str, spec: PoolSpec) -> Result<(), ClusterError> {
        self.checked()?.pools.insert(name.to_string(), spec);
        Ok(())
    }

    async fn set_pool_status(&self, name: &str, status: PoolStatus) -> Result<(), ClusterError> {
        let mut state = self.checked()?;
        if !state.pools.contains_key(name) {
            return Err(ClusterError::NotFound(format!("pool {name}")));
        }
        state.pool_status.insert(name.to_string(), status);
        Ok(())
    }

    async fn delete_pool(&self, name: &str) -> Result<bool, ClusterError> {
        let mut state = self.checked()?;
        state.pool_status.remove(name);
        Ok(state.pools.remove(name).is_some())
    }
}

/// Pod owned by `owner_kind/owner_name`, in phase Running, with the resource requested
/// when `resource` is given
pub fn pod(
    namespace: &str,
    name: &str,
    owner: Option<(&str, &str)>,
    resource: Option<&str>,
    annotations: &[(&str, &str)],
) -> Pod {
    use k8s_openapi::api::core::v1::{Container, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    let requests = resource.map(|r| BTreeMap::from([(r.to_string(), Quantity("1".to_string()))]));
    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            uid: Some(format!("uid-{name}")),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            owner_references: owner.map(|(kind, owner_name)| {
                vec![OwnerReference {
                    kind: kind.to_string(),
                    name: owner_name.to_string(),
                    api_version: "apps/v1".to_string(),
                    uid: format!("uid-{owner_name}"),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                resources: Some(ResourceRequirements {
                    requests,
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

/// Binding target of a recorded binding
pub fn binding_node(binding: &Binding) -> &str {
    let ObjectReference { name, .. } = &binding.target;
    name.as_deref().unwrap_or_default()
}
