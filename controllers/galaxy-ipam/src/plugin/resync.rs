//! Resync: reconcile the tables with the pods that actually exist
//!
//! Pod events can be missed (restarts, leader changes). Resync walks every allocated
//! row, applies the release policy to keys whose pod is gone, and records addresses
//! that running pods carry in their CNI args but the tables do not.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use floatingip::{Attr, FloatingIpRecord, Key};
use k8s_openapi::api::core::v1::Pod;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CniArgs, FloatingIpPlugin, PluginError, attr_of, key_of, policy_of};
use crate::cluster::{evicted, pod_name, pod_phase};

/// What one resync pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncStats {
    /// Rows released or reserved because their pod is gone
    pub reclaimed: usize,
    /// Rows written from running pods' CNI args
    pub synced: usize,
}

impl FloatingIpPlugin {
    /// Run [`resync`](Self::resync) now and every `interval` until cancelled
    pub async fn run_resync(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Resync loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.resync().await {
                        Ok(stats) => debug!("Resync done: {:?}", stats),
                        Err(e) => error!("Resync failed: {}", e),
                    }
                }
            }
        }
    }

    /// One reconciliation pass
    pub async fn resync(&self) -> Result<ResyncStats, PluginError> {
        let pods = self.cluster.list_pods().await?;
        let existing: HashSet<String> = pods
            .iter()
            .filter(|p| self.wants(p) && !evicted(p))
            .filter_map(|p| key_of(p).ok())
            .map(|k| k.to_string())
            .collect();

        let mut by_key: BTreeMap<String, Vec<FloatingIpRecord>> = BTreeMap::new();
        for record in self.store.lookup_by_prefix("").await? {
            if !record.is_free() {
                by_key.entry(record.key.clone()).or_default().push(record);
            }
        }

        let mut stats = ResyncStats::default();
        for (raw, records) in by_key {
            if existing.contains(&raw) {
                continue;
            }
            let key = match Key::decode(&raw) {
                Ok(key) if !key.pod_name.is_empty() => key,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Skipping row with bad key: {}", e);
                    continue;
                }
            };
            match self.reclaim(&key, &records).await {
                Ok(changed) => stats.reclaimed += changed,
                Err(e) => warn!("Failed to reclaim ips of {}: {}", raw, e),
            }
        }

        for pod in &pods {
            match self.sync_pod_ip(pod).await {
                Ok(synced) => stats.synced += synced,
                Err(e) => warn!("Failed to sync ip of pod {}: {}", pod_name(pod), e),
            }
        }

        if let Err(e) = self.refresh_ip_counter().await {
            warn!("Failed to refresh ip counter: {}", e);
        }
        if stats != ResyncStats::default() {
            info!("Resync reclaimed {} and synced {} ips", stats.reclaimed, stats.synced);
        }
        Ok(stats)
    }

    /// Apply the release policy to `key` once the API server confirms its pod is gone
    async fn reclaim(&self, key: &Key, records: &[FloatingIpRecord]) -> Result<usize, PluginError> {
        let raw = key.to_string();
        let _guard = self.pod_locks.lock(&raw).await;
        if self.cluster.get_pod(&key.namespace, &key.pod_name).await?.is_some() {
            debug!("Pod of {} exists, not reclaiming", raw);
            return Ok(0);
        }
        if self.cloud.is_some() {
            for record in records.iter().filter(|r| !r.attr.node_name.is_empty()) {
                self.unassign(record, &record.attr.node_name).await?;
                // forget the node so a later pass does not unassign twice
                self.ipam_for(record.ip).reserve_ip(&raw, &raw, &Attr::default()).await?;
            }
        }
        self.release_by_policy(key, records).await
    }

    /// Record the addresses a running pod carries in its CNI args; returns rows written
    pub async fn sync_pod_ip(&self, pod: &Pod) -> Result<usize, PluginError> {
        if pod_phase(pod) != "Running" || !self.wants(pod) {
            return Ok(0);
        }
        let Some(args) = CniArgs::from_pod(pod) else {
            return Ok(0);
        };
        let key = key_of(pod)?.to_string();
        let node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()).unwrap_or_default();
        let mut synced = 0;
        for info in args.common.ipinfos {
            let ip = info.ip.addr();
            let ipam = self.ipam_for(ip);
            match ipam.by_ip(ip).await? {
                None => warn!("Pod {} uses ip {} outside every pool", pod_name(pod), ip),
                Some(row) if row.is_free() => {
                    ipam.allocate_specific_ip(&key, ip, policy_of(pod), &attr_of(pod, node))
                        .await?;
                    info!("Synced ip {} of pod {} into {}", ip, pod_name(pod), ipam.name());
                    synced += 1;
                }
                Some(row) if row.key == key => {}
                Some(row) => warn!(
                    "Ip {} of pod {} is owned by {} in {}",
                    ip,
                    pod_name(pod),
                    row.key,
                    ipam.name()
                ),
            }
        }
        Ok(synced)
    }
}
