//! Pool management
//!
//! Creates, updates and deletes Pool objects and, when asked to, reserves the pool's
//! addresses up front under the bare `pool__<name>_` key so pods joining the pool
//! later can take them over.

use std::sync::Arc;

use chrono::Utc;
use crds::{PoolSpec, PoolStatus};
use floatingip::key::POOL_PREFIX;
use floatingip::{Attr, FloatingIpError, ReleasePolicy};
use ipnet::Ipv4Net;
use tracing::{info, warn};

use crate::plugin::{FloatingIpPlugin, PluginError};

/// Result of reserving a pool's addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreAllocation {
    /// The pool holds at least `size` addresses
    Complete {
        /// Addresses held under the pool prefix
        real_pool_size: u32,
    },
    /// Free addresses ran out before reaching `size`
    Short {
        /// Addresses held under the pool prefix
        real_pool_size: u32,
    },
}

impl PreAllocation {
    /// Addresses held under the pool prefix
    pub fn real_pool_size(self) -> u32 {
        match self {
            Self::Complete { real_pool_size } | Self::Short { real_pool_size } => real_pool_size,
        }
    }
}

/// Pool CRUD on top of the plugin
#[derive(Debug)]
pub struct PoolManager {
    plugin: Arc<FloatingIpPlugin>,
}

impl PoolManager {
    pub fn new(plugin: Arc<FloatingIpPlugin>) -> Self {
        Self { plugin }
    }

    /// Spec of pool `name`
    pub async fn get(&self, name: &str) -> Result<Option<PoolSpec>, PluginError> {
        Ok(self.plugin.cluster().get_pool(name).await?.map(|pool| pool.spec))
    }

    /// Create or update pool `name`; pre-allocates when the spec asks for it
    pub async fn apply(&self, name: &str, spec: PoolSpec) -> Result<Option<PreAllocation>, PluginError> {
        validate_name(name)?;
        self.plugin.cluster().apply_pool(name, spec.clone()).await?;
        info!("Applied pool {} size {} preAllocateIP {}", name, spec.size, spec.pre_allocate_ip);
        if !spec.pre_allocate_ip {
            return Ok(None);
        }
        let result = self.pre_allocate(name, spec.size).await?;
        let status = PoolStatus {
            real_pool_size: result.real_pool_size(),
            last_allocated: Some(Utc::now()),
        };
        if let Err(e) = self.plugin.cluster().set_pool_status(name, status).await {
            warn!("Failed to update status of pool {}: {}", name, e);
        }
        Ok(Some(result))
    }

    /// Delete pool `name`; false when it did not exist. Addresses held under the pool
    /// prefix stay where they are.
    pub async fn delete(&self, name: &str) -> Result<bool, PluginError> {
        let deleted = self.plugin.cluster().delete_pool(name).await?;
        if deleted {
            info!("Deleted pool {}", name);
        }
        Ok(deleted)
    }

    /// Reserve addresses under `pool__<name>_` until the pool prefix holds `size` rows
    pub async fn pre_allocate(&self, name: &str, size: u32) -> Result<PreAllocation, PluginError> {
        let prefix = format!("{POOL_PREFIX}{name}_");
        let _guard = self.plugin.pool_locks().lock(&prefix).await;
        let ipam = self.plugin.ipam();
        let existing = count(ipam.by_prefix(&prefix).await?.len());
        let subnets = ipam.node_subnets_by_key("").await?;
        if size <= existing {
            return Ok(PreAllocation::Complete { real_pool_size: existing });
        }
        if subnets.is_empty() {
            warn!("No free ip left to pre-allocate pool {}", name);
            return Ok(PreAllocation::Short { real_pool_size: existing });
        }

        let mut held = existing;
        let attr = Attr::default();
        'subnets: for subnet in &subnets {
            let Ok(net) = subnet.parse::<Ipv4Net>() else {
                warn!("Skipping unparsable node subnet {}", subnet);
                continue;
            };
            while held < size {
                match ipam.allocate_in_subnet(&prefix, Some(&net), ReleasePolicy::Never, &attr).await {
                    Ok(ip) => {
                        info!("Pre-allocated {} to pool {} in {}", ip, name, subnet);
                        held += 1;
                    }
                    Err(FloatingIpError::CapacityExhausted) => continue 'subnets,
                    Err(e) => return Err(e.into()),
                }
            }
            break;
        }
        if held < size {
            warn!("Pool {} wants {} ips, only {} available", name, size, held);
            return Ok(PreAllocation::Short { real_pool_size: held });
        }
        Ok(PreAllocation::Complete { real_pool_size: held })
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn validate_name(name: &str) -> Result<(), PluginError> {
    if name.is_empty() || name.contains('_') {
        return Err(FloatingIpError::InvalidPool(format!("invalid pool name {name:?}")).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::testing::*;

    #[tokio::test]
    async fn test_apply_without_pre_allocation() {
        let f = fixture().await;
        let pools = PoolManager::new(f.plugin.clone());
        let result = pools.apply("web", PoolSpec { size: 2, pre_allocate_ip: false }).await.unwrap();
        assert_eq!(result, None);
        assert_eq!(pools.get("web").await.unwrap().unwrap().size, 2);
        assert!(f.cluster.pool_status("web").is_none());
    }

    #[tokio::test]
    async fn test_pre_allocate_across_subnets() {
        let f = fixture().await;
        let pools = PoolManager::new(f.plugin.clone());
        let result = pools.apply("web", PoolSpec { size: 4, pre_allocate_ip: true }).await.unwrap();
        assert_eq!(result, Some(PreAllocation::Complete { real_pool_size: 4 }));
        assert_eq!(f.plugin.ipam().by_prefix("pool__web_").await.unwrap().len(), 4);
        assert_eq!(f.cluster.pool_status("web").unwrap().real_pool_size, 4);

        // already satisfied
        let again = pools.pre_allocate("web", 3).await.unwrap();
        assert_eq!(again, PreAllocation::Complete { real_pool_size: 4 });
    }

    #[tokio::test]
    async fn test_pre_allocate_short() {
        let f = fixture().await;
        let pools = PoolManager::new(f.plugin.clone());
        let result = pools.apply("big", PoolSpec { size: 10, pre_allocate_ip: true }).await.unwrap();
        assert_eq!(result, Some(PreAllocation::Short { real_pool_size: 5 }));

        let none_left = pools.pre_allocate("other", 1).await.unwrap();
        assert_eq!(none_left, PreAllocation::Short { real_pool_size: 0 });
    }

    #[tokio::test]
    async fn test_pre_allocated_rows_use_never_policy() {
        let f = fixture().await;
        let pools = PoolManager::new(f.plugin.clone());
        pools.pre_allocate("web", 1).await.unwrap();
        let rows = f.plugin.ipam().by_prefix("pool__web_").await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = f.backend.get(rows[0].record.ip).unwrap();
        assert_eq!(row.key, "pool__web_");
        assert_eq!(row.policy, ReleasePolicy::Never);
    }

    #[tokio::test]
    async fn test_delete_and_invalid_name() {
        let f = fixture().await;
        let pools = PoolManager::new(f.plugin.clone());
        pools.apply("web", PoolSpec { size: 1, pre_allocate_ip: true }).await.unwrap();
        assert!(pools.delete("web").await.unwrap());
        assert!(!pools.delete("web").await.unwrap());
        assert!(pools.get("web").await.unwrap().is_none());
        // reserved rows survive the pool object
        assert_eq!(f.plugin.ipam().by_prefix("pool__web_").await.unwrap().len(), 1);

        let err = pools.apply("bad_name", PoolSpec::default()).await.unwrap_err();
        assert!(matches!(err, PluginError::Store(FloatingIpError::InvalidPool(_))));
    }
}
