//! Cluster backed by the Kubernetes API

use crds::{POOL_NAMESPACE, Pool, PoolSpec, PoolStatus};
use floatingip::AppType;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Binding, Node, Pod};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use tracing::debug;

use super::cluster_trait::{Cluster, ClusterError};

/// Field manager used for server-side apply of pools
const FIELD_MANAGER: &str = "galaxy-ipam";

/// [`Cluster`] talking to the API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    tapp: ApiResource,
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster").field("tapp", &self.tapp.kind).finish_non_exhaustive()
    }
}

impl KubeCluster {
    /// Cluster over `client`
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("apps.tkestack.io", "v1", "TApp");
        Self {
            client,
            tapp: ApiResource::from_gvk_with_plural(&gvk, "tapps"),
        }
    }

    fn pools(&self) -> Api<Pool> {
        Api::namespaced(self.client.clone(), POOL_NAMESPACE)
    }
}

fn classify(err: kube::Error, what: impl FnOnce() -> String) -> ClusterError {
    match err {
        kube::Error::Api(status) if status.code == 404 => ClusterError::NotFound(what()),
        other => ClusterError::Kube(other),
    }
}

fn replicas_or_default(replicas: Option<i32>) -> u32 {
    // unset replicas means 1 on the API server
    replicas.map_or(1, |r| u32::try_from(r).unwrap_or(0))
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn workload_replicas(
        &self,
        app_type: AppType,
        namespace: &str,
        name: &str,
    ) -> Result<Option<u32>, ClusterError> {
        match app_type {
            AppType::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                Ok(api
                    .get_opt(name)
                    .await?
                    .map(|d| replicas_or_default(d.spec.and_then(|s| s.replicas))))
            }
            AppType::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                Ok(api
                    .get_opt(name)
                    .await?
                    .map(|s| replicas_or_default(s.spec.and_then(|s| s.replicas))))
            }
            AppType::TApp => {
                let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &self.tapp);
                Ok(api.get_opt(name).await?.map(|tapp| {
                    let replicas = tapp.data["spec"]["replicas"]
                        .as_i64()
                        .and_then(|r| i32::try_from(r).ok());
                    replicas_or_default(replicas)
                }))
            }
        }
    }

    async fn bind_pod(&self, binding: &Binding) -> Result<(), ClusterError> {
        let namespace = binding.metadata.namespace.as_deref().unwrap_or("default");
        let name = binding.metadata.name.clone().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let body = serde_json::to_vec(binding).map_err(|e| ClusterError::Unavailable(e.to_string()))?;
        api.create_subresource::<serde_json::Value>("binding", &name, &PostParams::default(), body)
            .await
            .map_err(|e| classify(e, || format!("pod {namespace}/{name}")))?;
        debug!("Bound pod {}/{}", namespace, name);
        Ok(())
    }

    async fn get_pool(&self, name: &str) -> Result<Option<Pool>, ClusterError> {
        Ok(self.pools().get_opt(name).await?)
    }

    async fn apply_pool(&self, name: &str, spec: PoolSpec) -> Result<(), ClusterError> {
        let pool = Pool::named(name, spec.size, spec.pre_allocate_ip);
        self.pools()
            .patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&pool))
            .await?;
        Ok(())
    }

    async fn set_pool_status(&self, name: &str, status: PoolStatus) -> Result<(), ClusterError> {
        let patch = serde_json::json!({ "status": status });
        self.pools()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, || format!("pool {name}")))?;
        Ok(())
    }

    async fn delete_pool(&self, name: &str) -> Result<bool, ClusterError> {
        match self.pools().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) => match classify(e, || format!("pool {name}")) {
                ClusterError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}
