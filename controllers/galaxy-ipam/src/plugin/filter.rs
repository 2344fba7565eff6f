//! Filter: which nodes can serve a pod's floating IP

use std::collections::{BTreeMap, BTreeSet};

use floatingip::{AppType, Key, ReleasePolicy};
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info};

use super::{FloatingIpPlugin, PluginError, REASON_NO_CONFIG_NODE, REASON_NO_FIP_LEFT, key_of, policy_of};
use crate::cluster::{ClusterError, pod_name};

/// Nodes that passed and nodes that failed with their reason
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOutcome {
    /// Nodes able to serve the pod
    pub nodes: Vec<String>,
    /// Rejected nodes with reason
    pub failed: BTreeMap<String, String>,
}

impl FloatingIpPlugin {
    /// Split `nodes` into those that can serve `pod` and those that cannot
    pub async fn filter(&self, pod: &Pod, nodes: &[String]) -> Result<FilterOutcome, PluginError> {
        if !self.wants(pod) {
            return Ok(FilterOutcome {
                nodes: nodes.to_vec(),
                failed: BTreeMap::new(),
            });
        }
        let key = key_of(pod)?;
        let subnets = self.eligible_subnets(pod, &key).await?;
        debug!("Pod {} may use subnets {:?}", pod_name(pod), subnets);

        let mut outcome = FilterOutcome::default();
        for node in nodes {
            match self.node_subnet(node).await? {
                None => {
                    outcome.failed.insert(node.clone(), REASON_NO_CONFIG_NODE.to_string());
                }
                Some(subnet) if subnets.contains(&subnet.to_string()) => outcome.nodes.push(node.clone()),
                Some(_) => {
                    outcome.failed.insert(node.clone(), REASON_NO_FIP_LEFT.to_string());
                }
            }
        }
        info!(
            "Filtered pod {}: {} nodes fit, {} failed",
            pod_name(pod),
            outcome.nodes.len(),
            outcome.failed.len()
        );
        Ok(outcome)
    }

    /// Node subnets a pod may get an address in
    async fn eligible_subnets(&self, pod: &Pod, key: &Key) -> Result<BTreeSet<String>, PluginError> {
        let raw = key.to_string();
        let held = self.ipam.node_subnets_by_key(&raw).await?;
        if !held.is_empty() {
            return Ok(held);
        }
        if key.is_deployment() && policy_of(pod) != ReleasePolicy::Immediate {
            let reserved = self.reserved_subnets(key).await?;
            if !reserved.is_empty() {
                return Ok(reserved);
            }
        }
        Ok(self.ipam.node_subnets_by_key("").await?)
    }

    /// Subnets of rows reserved under the pool prefix, after checking the workload
    /// or pool has room for one more address
    async fn reserved_subnets(&self, key: &Key) -> Result<BTreeSet<String>, PluginError> {
        let (replicas, pool_size_defined) = self.capacity_of(key).await?;
        let prefix = key.pool_prefix();
        let app_prefix = key.pool_app_prefix();
        let mut used = 0usize;
        let mut unused = BTreeSet::new();
        for row in self.ipam.by_prefix(&prefix).await? {
            if row.record.key == prefix {
                unused.extend(row.record.node_subnets().map(ToString::to_string));
            } else if !key.in_pool() || pool_size_defined || row.record.key.starts_with(&app_prefix) {
                used += 1;
            }
        }
        if used >= replicas as usize {
            return Err(PluginError::Capacity(if pool_size_defined {
                format!("reached pool {} size limit of {}", key.pool_name, replicas)
            } else {
                format!(
                    "deployment {} has allocated {} ips with replicas of {}, wait for releasing",
                    key.app_name, used, replicas
                )
            }));
        }
        Ok(unused)
    }

    /// Addresses a deployment key may hold and whether the limit comes from a Pool
    async fn capacity_of(&self, key: &Key) -> Result<(u32, bool), PluginError> {
        if key.in_pool()
            && let Some(pool) = self.cluster.get_pool(&key.pool_name).await?
        {
            return Ok((pool.spec.size, true));
        }
        let replicas = self
            .cluster
            .workload_replicas(AppType::Deployment, &key.namespace, &key.app_name)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("deployment {}/{}", key.namespace, key.app_name)))?;
        Ok((replicas, false))
    }
}
