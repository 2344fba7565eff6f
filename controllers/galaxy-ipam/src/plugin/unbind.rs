//! Unbind: apply the release policy to the address of a pod that went away

use std::collections::BTreeMap;

use floatingip::{
    Attr, FloatingIpError, FloatingIpRecord, Key, ReleaseDecision, ReleaseOutcome, ReleasePolicy, WorkloadState,
    batch_release, policy::decide,
};
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, error, info, warn};

use super::{FloatingIpPlugin, PluginError, key_of};
use crate::cloudprovider::UnassignIpRequest;
use crate::cluster::pod_name;

impl FloatingIpPlugin {
    /// Release or reserve the address of a deleted or finished pod
    pub async fn unbind(&self, pod: &Pod) -> Result<(), PluginError> {
        if !self.wants(pod) {
            return Ok(());
        }
        let key = key_of(pod)?;
        let raw = key.to_string();
        let _guard = self.pod_locks.lock(&raw).await;
        let records = self.store.lookup_by_key(&raw).await?;
        if records.is_empty() {
            debug!("Pod {} holds no ip", pod_name(pod));
            return Ok(());
        }
        if self.cloud.is_some() {
            let node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()).unwrap_or_default();
            for record in &records {
                let node = if record.attr.node_name.is_empty() { node } else { &record.attr.node_name };
                self.unassign(record, node).await?;
            }
        }
        self.release_by_policy(&key, &records).await?;
        Ok(())
    }

    /// Detach `record` from `node` at the cloud provider, if one is configured
    pub(crate) async fn unassign(&self, record: &FloatingIpRecord, node: &str) -> Result<(), PluginError> {
        let Some(cloud) = &self.cloud else {
            return Ok(());
        };
        if node.is_empty() {
            warn!("No node recorded for {}, skipping UnAssignIP", record.ip);
            return Ok(());
        }
        cloud
            .unassign_ip(&UnassignIpRequest {
                node_name: node.to_string(),
                ip_address: record.ip.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Apply each row's release policy; returns how many rows changed.
    ///
    /// For deployments the count of rows under the app prefix and the writes that
    /// follow happen under the prefix lock, so concurrent unbinds of one deployment
    /// never release below its replica count.
    pub(crate) async fn release_by_policy(
        &self,
        key: &Key,
        records: &[FloatingIpRecord],
    ) -> Result<usize, PluginError> {
        let raw = key.to_string();
        let needs_workload = records.iter().any(|r| r.policy == ReleasePolicy::Immutable);
        let counts_prefix = key.is_deployment() && needs_workload;
        let prefix = key.pool_prefix();
        let _prefix_guard = if counts_prefix {
            Some(self.pool_locks.lock(&prefix).await)
        } else {
            None
        };
        let workload = if needs_workload {
            self.workload_state(key).await
        } else {
            WorkloadState::Unknown
        };
        let allocated = if counts_prefix {
            self.store.lookup_by_prefix(&prefix).await?.len()
        } else {
            0
        };

        let mut to_release = BTreeMap::new();
        let mut changed = 0;
        for record in records {
            match decide(key, record.policy, workload, allocated)? {
                ReleaseDecision::Release { reason } => {
                    info!("Releasing ip {} of {}: {}", record.ip, raw, reason);
                    to_release.insert(record.ip, raw.clone());
                }
                ReleaseDecision::Reserve { key: target, reason } => {
                    match self.ipam_for(record.ip).reserve_ip(&raw, &target, &Attr::default()).await {
                        Ok(true) => {
                            info!("Reserved ip {} of {} under {}: {}", record.ip, raw, target, reason);
                            changed += 1;
                        }
                        Ok(false) => {}
                        Err(FloatingIpError::NotFound(_)) => {
                            debug!("Ip {} of {} already moved", record.ip, raw);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                ReleaseDecision::Keep => {}
            }
        }
        if !to_release.is_empty() {
            changed += self.release_ips(to_release).await?.released.len();
        }
        Ok(changed)
    }

    /// Release `ip -> expected key` across both tables
    pub(crate) async fn release_ips(
        &self,
        ip_to_key: BTreeMap<std::net::Ipv4Addr, String>,
    ) -> Result<ReleaseOutcome, PluginError> {
        match batch_release(ip_to_key, self.store.backends()).await {
            Ok(outcome) => {
                for (ip, owner) in &outcome.unreleased {
                    warn!("Ip {} not released, now owned by {:?}", ip, owner);
                }
                Ok(outcome)
            }
            Err(partial) => {
                error!(
                    "Released {:?} before failing, left {:?}",
                    partial.outcome.released, partial.outcome.unreleased
                );
                Err(partial.source.into())
            }
        }
    }

    async fn workload_state(&self, key: &Key) -> WorkloadState {
        let Some(app_type) = key.app_type else {
            return WorkloadState::Unknown;
        };
        match self
            .cluster
            .workload_replicas(app_type, &key.namespace, &key.app_name)
            .await
        {
            Ok(Some(replicas)) => WorkloadState::Replicas(replicas),
            Ok(None) => WorkloadState::Missing,
            Err(e) => {
                warn!("Failed to get {} {}/{}: {}", app_type, key.namespace, key.app_name, e);
                WorkloadState::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use super::super::testing::*;
    use super::*;
    use crate::cloudprovider::mock::FakeCloudProvider;
    use crate::cluster::mock::{FakeCluster, pod};
    use crate::plugin::bind::BindRequest;
    use floatingip::{AllocationBackend, AppType, Ipam, MemoryBackend};
    use floatingip::policy::RELEASE_POLICY_ANNOTATION;

    async fn bound(f: &Fixture, name: &str, owner: (&str, &str), annotations: &[(&str, &str)]) -> Pod {
        let p = pod("ns", name, Some(owner), Some(RESOURCE), annotations);
        f.cluster.add_pod(p.clone());
        f.plugin
            .bind(&BindRequest {
                namespace: "ns".to_string(),
                name: name.to_string(),
                uid: format!("uid-{name}"),
                node: "node-a".to_string(),
            })
            .await
            .unwrap();
        p
    }

    #[tokio::test]
    async fn test_immediate_pod_released() {
        let f = fixture().await;
        let p = bound(&f, "web-5f8d-1", ("ReplicaSet", "web-5f8d"), &[]).await;
        f.plugin.unbind(&p).await.unwrap();
        assert!(f.backend.get(Ipv4Addr::new(10, 0, 70, 2)).unwrap().is_free());
    }

    #[tokio::test]
    async fn test_immutable_deployment_reserved_under_prefix() {
        let f = fixture().await;
        f.cluster.set_replicas(AppType::Deployment, "ns", "web", 2);
        let p = bound(&f, "web-5f8d-1", ("ReplicaSet", "web-5f8d"), &[(RELEASE_POLICY_ANNOTATION, "immutable")]).await;
        f.plugin.unbind(&p).await.unwrap();
        let row = f.backend.get(Ipv4Addr::new(10, 0, 70, 2)).unwrap();
        assert_eq!(row.key, "dp_ns_web_");
        assert_eq!(row.attr, Attr::default());
    }

    #[tokio::test]
    async fn test_immutable_deployment_released_when_deleted() {
        let f = fixture().await;
        let p = bound(&f, "web-5f8d-1", ("ReplicaSet", "web-5f8d"), &[(RELEASE_POLICY_ANNOTATION, "immutable")]).await;
        f.plugin.unbind(&p).await.unwrap();
        assert!(f.backend.get(Ipv4Addr::new(10, 0, 70, 2)).unwrap().is_free());
    }

    #[tokio::test]
    async fn test_statefulset_scaled_down_released() {
        let f = fixture().await;
        f.cluster.set_replicas(AppType::StatefulSet, "ns", "db", 3);
        let keep = bound(&f, "db-1", ("StatefulSet", "db"), &[(RELEASE_POLICY_ANNOTATION, "immutable")]).await;
        let gone = bound(&f, "db-2", ("StatefulSet", "db"), &[(RELEASE_POLICY_ANNOTATION, "immutable")]).await;
        f.cluster.set_replicas(AppType::StatefulSet, "ns", "db", 2);

        f.plugin.unbind(&keep).await.unwrap();
        f.plugin.unbind(&gone).await.unwrap();

        let kept = f.backend.get(Ipv4Addr::new(10, 0, 70, 2)).unwrap();
        assert_eq!(kept.key, "sts_ns_db_db-1");
        assert!(kept.attr.uid.is_empty());
        assert!(f.backend.get(Ipv4Addr::new(10, 0, 70, 3)).unwrap().is_free());
    }

    /// Memory table that yields to the scheduler before every call, like a remote database
    #[derive(Debug)]
    struct YieldingBackend(MemoryBackend);

    #[async_trait::async_trait]
    impl AllocationBackend for YieldingBackend {
        fn name(&self) -> &str {
            self.0.name()
        }

        async fn ensure_schema(&self) -> floatingip::Result<()> {
            tokio::task::yield_now().await;
            self.0.ensure_schema().await
        }

        async fn insert_free(&self, rows: &[(Ipv4Addr, String)]) -> floatingip::Result<u64> {
            tokio::task::yield_now().await;
            self.0.insert_free(rows).await
        }

        async fn lookup_by_ip_set(&self, ips: &[Ipv4Addr]) -> floatingip::Result<Vec<FloatingIpRecord>> {
            tokio::task::yield_now().await;
            self.0.lookup_by_ip_set(ips).await
        }

        async fn lookup_by_key(&self, key: &str) -> floatingip::Result<Vec<FloatingIpRecord>> {
            tokio::task::yield_now().await;
            self.0.lookup_by_key(key).await
        }

        async fn lookup_by_prefix(&self, prefix: &str) -> floatingip::Result<Vec<FloatingIpRecord>> {
            tokio::task::yield_now().await;
            self.0.lookup_by_prefix(prefix).await
        }

        async fn lookup_by_keyword(&self, keyword: &str) -> floatingip::Result<Vec<FloatingIpRecord>> {
            tokio::task::yield_now().await;
            self.0.lookup_by_keyword(keyword).await
        }

        async fn find_free(&self, subnet: Option<&str>, limit: u32) -> floatingip::Result<Vec<FloatingIpRecord>> {
            tokio::task::yield_now().await;
            self.0.find_free(subnet, limit).await
        }

        async fn claim(&self, ip: Ipv4Addr, key: &str, policy: ReleasePolicy, attr: &Attr) -> floatingip::Result<()> {
            tokio::task::yield_now().await;
            self.0.claim(ip, key, policy, attr).await
        }

        async fn transfer(
            &self,
            old_key: &str,
            new_key: &str,
            subnet: Option<&str>,
            policy: ReleasePolicy,
            attr: &Attr,
        ) -> floatingip::Result<Ipv4Addr> {
            tokio::task::yield_now().await;
            self.0.transfer(old_key, new_key, subnet, policy, attr).await
        }

        async fn update_attr(
            &self,
            ip: Ipv4Addr,
            key: &str,
            policy: ReleasePolicy,
            attr: &Attr,
        ) -> floatingip::Result<()> {
            tokio::task::yield_now().await;
            self.0.update_attr(ip, key, policy, attr).await
        }

        async fn release(&self, records: &[FloatingIpRecord]) -> floatingip::Result<()> {
            tokio::task::yield_now().await;
            self.0.release(records).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_immutable_unbinds_keep_replica_floor() {
        let backend = MemoryBackend::new("ip_pool");
        let ipam = Ipam::new("ip_pool", Arc::new(YieldingBackend(backend.clone())), pools());
        ipam.configure().await.unwrap();
        let cluster = FakeCluster::new();
        cluster.set_replicas(AppType::Deployment, "ns", "web", 2);

        let annotations = [(RELEASE_POLICY_ANNOTATION, "immutable")];
        let mut pods = Vec::new();
        for (last, name) in [(2, "web-5f8d-1"), (3, "web-5f8d-2")] {
            let ip = Ipv4Addr::new(10, 0, 70, last);
            let raw = format!("dp_ns_web_{name}");
            backend.put(ip, &raw, SUBNET_A);
            ipam.update_attr(&raw, ip, ReleasePolicy::Immutable, &Attr::new("node-a", name))
                .await
                .unwrap();
            pods.push(pod("ns", name, Some(("ReplicaSet", "web-5f8d")), Some(RESOURCE), &annotations));
        }
        backend.put(Ipv4Addr::new(10, 0, 70, 4), "dp_ns_web_", SUBNET_A);

        let plugin = Arc::new(FloatingIpPlugin::new(ipam, None, Arc::new(cluster), RESOURCE));
        let tasks: Vec<_> = pods
            .into_iter()
            .map(|p| {
                let plugin = plugin.clone();
                tokio::spawn(async move { plugin.unbind(&p).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let held = (2..=4)
            .filter(|last| !backend.get(Ipv4Addr::new(10, 0, 70, *last)).unwrap().is_free())
            .count();
        assert_eq!(held, 2);
        for last in 2..=4 {
            let row = backend.get(Ipv4Addr::new(10, 0, 70, last)).unwrap();
            assert!(row.is_free() || row.key == "dp_ns_web_", "{row:?}");
        }
    }

    #[tokio::test]
    async fn test_never_policy_keeps_statefulset_ip() {
        let f = fixture().await;
        let p = bound(&f, "db-0", ("StatefulSet", "db"), &[(RELEASE_POLICY_ANNOTATION, "never")]).await;
        f.plugin.unbind(&p).await.unwrap();
        assert_eq!(f.backend.get(Ipv4Addr::new(10, 0, 70, 2)).unwrap().key, "sts_ns_db_db-0");
    }

    #[tokio::test]
    async fn test_unbind_unassigns_from_cloud() {
        let f = fixture().await;
        let cloud = FakeCloudProvider::new();
        let p = pod("ns", "db-0", Some(("StatefulSet", "db")), Some(RESOURCE), &[]);
        f.backend.put(Ipv4Addr::new(10, 0, 70, 4), "sts_ns_db_db-0", SUBNET_A);
        let ip = Ipv4Addr::new(10, 0, 70, 4);
        let attr = Attr::new("node-a", "uid-db-0");
        let ipam = f.plugin.ipam().clone();
        ipam.update_attr("sts_ns_db_db-0", ip, ReleasePolicy::Immediate, &attr).await.unwrap();
        let plugin = Arc::try_unwrap(f.plugin).ok().unwrap().with_cloud_provider(Arc::new(cloud.clone()));

        plugin.unbind(&p).await.unwrap();
        assert_eq!(cloud.unassigned()[0].node_name, "node-a");
        assert!(f.backend.get(Ipv4Addr::new(10, 0, 70, 4)).unwrap().is_free());

        // a failing unassign leaves the row for a retry
        f.backend.put(ip, "sts_ns_db_db-0", SUBNET_A);
        ipam.update_attr("sts_ns_db_db-0", ip, ReleasePolicy::Immediate, &attr).await.unwrap();
        cloud.reject(true);
        let p = pod("ns", "db-0", Some(("StatefulSet", "db")), Some(RESOURCE), &[]);
        assert!(plugin.unbind(&p).await.is_err());
        assert_eq!(f.backend.get(Ipv4Addr::new(10, 0, 70, 4)).unwrap().key, "sts_ns_db_db-0");
    }
}
