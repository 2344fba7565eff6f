//! Prioritize: prefer nodes in subnets the pod held addresses in before

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Pod;

use super::{FloatingIpPlugin, PluginError, key_of};

/// Score given to nodes in a previously used subnet
pub const PREFERRED_SCORE: i64 = 10;

impl FloatingIpPlugin {
    /// Score each of `nodes` for `pod`
    pub async fn prioritize(&self, pod: &Pod, nodes: &[String]) -> Result<Vec<(String, i64)>, PluginError> {
        if !self.wants(pod) {
            return Ok(nodes.iter().map(|n| (n.clone(), 0)).collect());
        }
        let key = key_of(pod)?;
        let mut subnets: BTreeSet<String> = self.ipam.node_subnets_by_key(&key.to_string()).await?;
        if key.app_type.is_some() {
            subnets.extend(self.ipam.node_subnets_by_key(&key.pool_prefix()).await?);
        }
        let mut scores = Vec::with_capacity(nodes.len());
        for node in nodes {
            let preferred = self
                .node_subnet(node)
                .await?
                .is_some_and(|subnet| subnets.contains(&subnet.to_string()));
            scores.push((node.clone(), if preferred { PREFERRED_SCORE } else { 0 }));
        }
        Ok(scores)
    }
}
