//! The allocator: one allocation table plus the pools it serves

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FloatingIpError, Result};
use crate::policy::ReleasePolicy;
use crate::pool::FloatingIpPool;
use crate::record::{Attr, FloatingIpRecord};
use crate::store::AllocationBackend;

/// Free rows fetched per allocation attempt
const CANDIDATE_BATCH: u32 = 16;

/// Container network settings handed to CNI for one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpInfo {
    /// Address with the container prefix length
    pub ip: Ipv4Net,
    /// Vlan id
    pub vlan: u16,
    /// Container gateway
    pub gateway: Ipv4Addr,
}

/// A row together with its network settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloatingIpInfo {
    /// Network settings
    pub info: IpInfo,
    /// Stored row
    pub record: FloatingIpRecord,
}

/// Allocator over one table
#[derive(Debug, Clone)]
pub struct Ipam {
    name: String,
    backend: Arc<dyn AllocationBackend>,
    pools: Arc<Vec<FloatingIpPool>>,
}

impl Ipam {
    /// Allocator named `name` over `backend` serving `pools`
    #[must_use]
    pub fn new(name: &str, backend: Arc<dyn AllocationBackend>, pools: Vec<FloatingIpPool>) -> Self {
        Self {
            name: name.to_string(),
            backend,
            pools: Arc::new(pools),
        }
    }

    /// Allocator name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Underlying table
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn AllocationBackend> {
        &self.backend
    }

    /// Configured pools, ordered by gateway
    #[must_use]
    pub fn pools(&self) -> &[FloatingIpPool] {
        &self.pools
    }

    /// Create the table and insert a free row for every pool address.
    ///
    /// Existing rows keep their owner; their subnet tag is refreshed.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn configure(&self) -> Result<()> {
        self.backend.ensure_schema().await?;
        let rows: Vec<(Ipv4Addr, String)> = self
            .pools
            .iter()
            .flat_map(|pool| {
                let tag = pool.subnet_tag();
                pool.addresses().map(move |ip| (ip, tag.clone()))
            })
            .collect();
        let touched = self.backend.insert_free(&rows).await?;
        info!(
            "Configured {} pools with {} ips in {} ({} rows touched)",
            self.pools.len(),
            rows.len(),
            self.backend.name(),
            touched
        );
        Ok(())
    }

    /// Node subnet of the pool serving `node_ip`
    #[must_use]
    pub fn node_subnet(&self, node_ip: Ipv4Addr) -> Option<Ipv4Net> {
        self.pools
            .iter()
            .flat_map(|p| p.node_subnets.iter())
            .find(|net| net.contains(&node_ip))
            .copied()
    }

    fn pool_of(&self, ip: Ipv4Addr) -> Option<&FloatingIpPool> {
        self.pools.iter().find(|p| p.contains(ip))
    }

    /// Network settings of `ip`, `None` when no pool holds it
    #[must_use]
    pub fn ip_info(&self, ip: Ipv4Addr) -> Option<IpInfo> {
        let pool = self.pool_of(ip)?;
        Some(IpInfo {
            ip: Ipv4Net::new(ip, pool.subnet.prefix_len()).ok()?,
            vlan: pool.vlan,
            gateway: pool.gateway,
        })
    }

    fn with_info(&self, record: FloatingIpRecord) -> Option<FloatingIpInfo> {
        let info = self.ip_info(record.ip)?;
        Some(FloatingIpInfo { info, record })
    }

    /// Claim a free address for `key`, within `subnet` when given.
    ///
    /// Losing a race for a candidate moves on to the next one.
    ///
    /// # Errors
    ///
    /// `CapacityExhausted` when no free address is left.
    pub async fn allocate_in_subnet(
        &self,
        key: &str,
        subnet: Option<&Ipv4Net>,
        policy: ReleasePolicy,
        attr: &Attr,
    ) -> Result<Ipv4Addr> {
        let subnet = subnet.map(ToString::to_string);
        loop {
            let candidates = self.backend.find_free(subnet.as_deref(), CANDIDATE_BATCH).await?;
            if candidates.is_empty() {
                return Err(FloatingIpError::CapacityExhausted);
            }
            for candidate in candidates {
                match self.backend.claim(candidate.ip, key, policy, attr).await {
                    Ok(()) => {
                        debug!("Allocated {} to {} in {}", candidate.ip, key, self.name);
                        return Ok(candidate.ip);
                    }
                    Err(FloatingIpError::Conflict(_)) => {
                        debug!("Lost race for {}, trying next candidate", candidate.ip);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Claim the specific address `ip` for `key`.
    ///
    /// Succeeds without change when `key` already owns it.
    ///
    /// # Errors
    ///
    /// `Conflict` when another key owns it, `NotFound` when no pool row exists.
    pub async fn allocate_specific_ip(
        &self,
        key: &str,
        ip: Ipv4Addr,
        policy: ReleasePolicy,
        attr: &Attr,
    ) -> Result<()> {
        match self.backend.claim(ip, key, policy, attr).await {
            Err(FloatingIpError::Conflict(msg)) => match self.by_ip(ip).await? {
                Some(current) if current.key == key => self.backend.update_attr(ip, key, policy, attr).await,
                _ => Err(FloatingIpError::Conflict(msg)),
            },
            other => other,
        }
    }

    /// Move an address held by `old_key` in `subnet` to `new_key`.
    ///
    /// # Errors
    ///
    /// `NotFound` when `old_key` holds nothing in `subnet`.
    pub async fn allocate_in_subnet_with_key(
        &self,
        old_key: &str,
        new_key: &str,
        subnet: &str,
        policy: ReleasePolicy,
        attr: &Attr,
    ) -> Result<Ipv4Addr> {
        self.backend
            .transfer(old_key, new_key, Some(subnet), policy, attr)
            .await
    }

    /// Move the address of `old_key` to `new_key`, keeping its policy and replacing the
    /// attributes.
    ///
    /// Returns false when nothing changed.
    ///
    /// # Errors
    ///
    /// `NotFound` when `old_key` holds no address.
    pub async fn reserve_ip(&self, old_key: &str, new_key: &str, attr: &Attr) -> Result<bool> {
        let current = self
            .backend
            .lookup_by_key(old_key)
            .await?
            .into_iter()
            .max_by_key(|r| r.updated_at)
            .ok_or_else(|| FloatingIpError::NotFound(format!("failed to find floatIP by key {old_key}")))?;
        if old_key == new_key && current.attr == *attr {
            return Ok(false);
        }
        self.backend
            .transfer(old_key, new_key, None, current.policy, attr)
            .await?;
        Ok(true)
    }

    /// Rewrite policy and attributes of `ip` owned by `key`
    ///
    /// # Errors
    ///
    /// `NotFound` when `key` does not own `ip`.
    pub async fn update_attr(&self, key: &str, ip: Ipv4Addr, policy: ReleasePolicy, attr: &Attr) -> Result<()> {
        self.backend.update_attr(ip, key, policy, attr).await
    }

    /// Release `ip` if `key` still owns it
    ///
    /// # Errors
    ///
    /// `StaleOwner` when another key owns it, `NotFound` when the row does not exist.
    pub async fn release(&self, key: &str, ip: Ipv4Addr) -> Result<()> {
        let mut record = self
            .by_ip(ip)
            .await?
            .ok_or_else(|| FloatingIpError::NotFound(format!("ip {ip} in {}", self.name)))?;
        key.clone_into(&mut record.key);
        self.backend.release(&[record]).await
    }

    /// First address held by `key`
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn first(&self, key: &str) -> Result<Option<FloatingIpInfo>> {
        Ok(self.by_key(key).await?.into_iter().next())
    }

    /// Addresses held by `key`, most recently updated first
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn by_key(&self, key: &str) -> Result<Vec<FloatingIpInfo>> {
        let mut records = self.backend.lookup_by_key(key).await?;
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records.into_iter().filter_map(|r| self.with_info(r)).collect())
    }

    /// Row of `ip`
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn by_ip(&self, ip: Ipv4Addr) -> Result<Option<FloatingIpRecord>> {
        Ok(self.backend.lookup_by_ip_set(&[ip]).await?.into_iter().next())
    }

    /// Rows whose key starts with `prefix`
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn by_prefix(&self, prefix: &str) -> Result<Vec<FloatingIpInfo>> {
        let records = self.backend.lookup_by_prefix(prefix).await?;
        Ok(records.into_iter().filter_map(|r| self.with_info(r)).collect())
    }

    /// Rows whose key contains `keyword`
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn by_keyword(&self, keyword: &str) -> Result<Vec<FloatingIpRecord>> {
        self.backend.lookup_by_keyword(keyword).await
    }

    /// Node subnets of the addresses held by `key`; the empty key yields the subnets that
    /// still have free addresses.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn node_subnets_by_key(&self, key: &str) -> Result<BTreeSet<String>> {
        let records = self.backend.lookup_by_key(key).await?;
        Ok(records
            .iter()
            .flat_map(|r| r.node_subnets().map(ToString::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FloatingIpPoolConf;
    use crate::store::MemoryBackend;

    fn pools() -> Vec<FloatingIpPool> {
        let confs: Vec<FloatingIpPoolConf> = serde_json::from_str(
            r#"[
              {"nodeSubnets":["10.49.27.0/24"],"ips":["10.0.70.2~10.0.70.4"],"subnet":"10.0.70.0/24","gateway":"10.0.70.1","vlan":2},
              {"nodeSubnets":["10.49.28.0/24"],"ips":["10.0.80.2"],"subnet":"10.0.80.0/24","gateway":"10.0.80.1"}
            ]"#,
        )
        .unwrap();
        FloatingIpPool::from_confs(&confs).unwrap()
    }

    async fn ipam() -> (Ipam, MemoryBackend) {
        let backend = MemoryBackend::new("ip_pool");
        let ipam = Ipam::new("primary", Arc::new(backend.clone()), pools());
        ipam.configure().await.unwrap();
        (ipam, backend)
    }

    fn subnet(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_configure_inserts_rows_idempotently() {
        let (ipam, backend) = ipam().await;
        assert_eq!(backend.len(), 4);
        ipam.configure().await.unwrap();
        assert_eq!(backend.len(), 4);
    }

    #[tokio::test]
    async fn test_node_subnet_and_ip_info() {
        let (ipam, _) = ipam().await;
        assert_eq!(ipam.node_subnet(Ipv4Addr::new(10, 49, 27, 9)), Some(subnet("10.49.27.0/24")));
        assert_eq!(ipam.node_subnet(Ipv4Addr::new(10, 50, 0, 1)), None);
        let info = ipam.ip_info(Ipv4Addr::new(10, 0, 70, 3)).unwrap();
        assert_eq!(info.ip.to_string(), "10.0.70.3/24");
        assert_eq!(info.vlan, 2);
        assert_eq!(info.gateway, Ipv4Addr::new(10, 0, 70, 1));
        assert_eq!(
            serde_json::to_string(&info).unwrap(),
            r#"{"ip":"10.0.70.3/24","vlan":2,"gateway":"10.0.70.1"}"#
        );
    }

    #[tokio::test]
    async fn test_allocate_until_exhausted() {
        let (ipam, _) = ipam().await;
        let net = subnet("10.49.28.0/24");
        let ip = ipam
            .allocate_in_subnet("dp_ns_a_a-1", Some(&net), ReleasePolicy::Immediate, &Attr::default())
            .await
            .unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 80, 2));
        let err = ipam
            .allocate_in_subnet("dp_ns_a_a-2", Some(&net), ReleasePolicy::Immediate, &Attr::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FloatingIpError::CapacityExhausted));
        assert_eq!(err.to_string(), "no enough available ips left");
    }

    #[tokio::test]
    async fn test_concurrent_claims_get_distinct_ips() {
        let (ipam, _) = ipam().await;
        let net = subnet("10.49.27.0/24");
        let mut handles = Vec::new();
        for i in 0..3 {
            let ipam = ipam.clone();
            handles.push(tokio::spawn(async move {
                ipam.allocate_in_subnet(&format!("sts_ns_db_db-{i}"), Some(&net), ReleasePolicy::Immediate, &Attr::default())
                    .await
            }));
        }
        let mut ips = BTreeSet::new();
        for h in handles {
            ips.insert(h.await.unwrap().unwrap());
        }
        assert_eq!(ips.len(), 3);
    }

    #[tokio::test]
    async fn test_release_requires_owner() {
        let (ipam, backend) = ipam().await;
        let ip = ipam
            .allocate_in_subnet("k1", None, ReleasePolicy::Immediate, &Attr::default())
            .await
            .unwrap();
        assert!(matches!(
            ipam.release("k2", ip).await,
            Err(FloatingIpError::StaleOwner { .. })
        ));
        assert_eq!(backend.get(ip).unwrap().key, "k1");
        ipam.release("k1", ip).await.unwrap();
        assert!(backend.get(ip).unwrap().is_free());
    }

    #[tokio::test]
    async fn test_reserve_keeps_policy() {
        let (ipam, backend) = ipam().await;
        let ip = ipam
            .allocate_in_subnet("dp_ns_web_web-1", None, ReleasePolicy::Immutable, &Attr::new("n1", "u1"))
            .await
            .unwrap();
        assert!(ipam.reserve_ip("dp_ns_web_web-1", "dp_ns_web_", &Attr::default()).await.unwrap());
        let row = backend.get(ip).unwrap();
        assert_eq!(row.key, "dp_ns_web_");
        assert_eq!(row.policy, ReleasePolicy::Immutable);
        assert_eq!(row.attr, Attr::default());
        assert!(!ipam.reserve_ip("dp_ns_web_", "dp_ns_web_", &Attr::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_allocate_with_key_and_subnets_by_key() {
        let (ipam, _) = ipam().await;
        let ip = ipam
            .allocate_in_subnet("pool__p_", Some(&subnet("10.49.27.0/24")), ReleasePolicy::Never, &Attr::default())
            .await
            .unwrap();
        assert_eq!(
            ipam.node_subnets_by_key("pool__p_").await.unwrap(),
            BTreeSet::from(["10.49.27.0/24".to_string()])
        );
        let moved = ipam
            .allocate_in_subnet_with_key("pool__p_", "pool__p_dp_ns_a_a-1", "10.49.27.0/24", ReleasePolicy::Never, &Attr::default())
            .await
            .unwrap();
        assert_eq!(moved, ip);
        assert_eq!(ipam.first("pool__p_dp_ns_a_a-1").await.unwrap().unwrap().record.ip, ip);
        // free rows remain in both subnets
        assert_eq!(ipam.node_subnets_by_key("").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_allocate_specific_ip() {
        let (ipam, _) = ipam().await;
        let ip = Ipv4Addr::new(10, 0, 70, 4);
        ipam.allocate_specific_ip("k1", ip, ReleasePolicy::Immediate, &Attr::default()).await.unwrap();
        ipam.allocate_specific_ip("k1", ip, ReleasePolicy::Never, &Attr::default()).await.unwrap();
        assert!(matches!(
            ipam.allocate_specific_ip("k2", ip, ReleasePolicy::Immediate, &Attr::default()).await,
            Err(FloatingIpError::Conflict(_))
        ));
        assert_eq!(ipam.by_ip(ip).await.unwrap().unwrap().policy, ReleasePolicy::Never);
    }
}
