//! Fan-out over the ordered allocation tables
//!
//! The first backend is the primary table. A missing table on any later backend
//! reads as empty; every other error propagates.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::record::FloatingIpRecord;
use crate::store::AllocationBackend;

/// Ordered list of allocation tables
#[derive(Debug, Clone)]
pub struct PartitionedStore {
    backends: Vec<Arc<dyn AllocationBackend>>,
}

impl PartitionedStore {
    /// Store over `backends`, primary first
    #[must_use]
    pub fn new(backends: Vec<Arc<dyn AllocationBackend>>) -> Self {
        Self { backends }
    }

    /// All backends in order
    #[must_use]
    pub fn backends(&self) -> &[Arc<dyn AllocationBackend>] {
        &self.backends
    }

    /// The primary backend, if any
    #[must_use]
    pub fn primary(&self) -> Option<&Arc<dyn AllocationBackend>> {
        self.backends.first()
    }

    async fn fan_out<'a, F, Fut>(&'a self, op: F) -> Result<Vec<FloatingIpRecord>>
    where
        F: Fn(&'a Arc<dyn AllocationBackend>) -> Fut,
        Fut: Future<Output = Result<Vec<FloatingIpRecord>>>,
    {
        let mut merged = Vec::new();
        for (i, backend) in self.backends.iter().enumerate() {
            match op(backend).await {
                Ok(records) => merged.extend(records),
                Err(e) if i > 0 && e.is_table_missing() => {
                    debug!("Table {} does not exist, treating as empty", backend.name());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(merged)
    }

    /// Rows whose key contains `keyword`, across all tables
    ///
    /// # Errors
    ///
    /// Propagates backend errors other than a missing secondary table.
    pub async fn lookup_by_keyword(&self, keyword: &str) -> Result<Vec<FloatingIpRecord>> {
        self.fan_out(|b| b.lookup_by_keyword(keyword)).await
    }

    /// Rows whose key starts with `prefix`, across all tables
    ///
    /// # Errors
    ///
    /// Propagates backend errors other than a missing secondary table.
    pub async fn lookup_by_prefix(&self, prefix: &str) -> Result<Vec<FloatingIpRecord>> {
        self.fan_out(|b| b.lookup_by_prefix(prefix)).await
    }

    /// Rows whose key equals `key`, across all tables
    ///
    /// # Errors
    ///
    /// Propagates backend errors other than a missing secondary table.
    pub async fn lookup_by_key(&self, key: &str) -> Result<Vec<FloatingIpRecord>> {
        self.fan_out(|b| b.lookup_by_key(key)).await
    }

    /// Rows for `ips`, across all tables
    ///
    /// # Errors
    ///
    /// Propagates backend errors other than a missing secondary table.
    pub async fn lookup_by_ip_set(&self, ips: &[Ipv4Addr]) -> Result<Vec<FloatingIpRecord>> {
        self.fan_out(|b| b.lookup_by_ip_set(ips)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FloatingIpError;
    use crate::store::MemoryBackend;

    #[tokio::test]
    async fn test_missing_secondary_reads_as_empty() {
        let primary = MemoryBackend::new("ip_pool");
        primary.put(Ipv4Addr::new(10, 0, 0, 1), "dp_ns_a_a-1", "s");
        let store = PartitionedStore::new(vec![Arc::new(primary), Arc::new(MemoryBackend::missing("ip_pool1"))]);
        let found = store.lookup_by_keyword("dp_").await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_primary_propagates() {
        let store = PartitionedStore::new(vec![Arc::new(MemoryBackend::missing("ip_pool"))]);
        assert!(matches!(
            store.lookup_by_prefix("").await,
            Err(FloatingIpError::TableMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_merges_partitions_in_order() {
        let primary = MemoryBackend::new("ip_pool");
        let second = MemoryBackend::new("ip_pool1");
        primary.put(Ipv4Addr::new(10, 0, 0, 1), "sts_ns_db_db-0", "s");
        second.put(Ipv4Addr::new(10, 1, 0, 1), "sts_ns_db_db-0", "s");
        let store = PartitionedStore::new(vec![Arc::new(primary), Arc::new(second)]);
        let found = store.lookup_by_key("sts_ns_db_db-0").await.unwrap();
        assert_eq!(
            found.iter().map(|r| r.ip).collect::<Vec<_>>(),
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 1, 0, 1)]
        );
    }
}
