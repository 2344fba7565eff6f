//! Release across allocation tables
//!
//! A batch of `ip -> expected key` pairs is released table by table. Each table only
//! releases rows still carrying the expected key; rows that changed owner are reported
//! back with their current key instead of being cleared.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::error::FloatingIpError;
use crate::record::FloatingIpRecord;
use crate::store::AllocationBackend;

/// Result of a batch release
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Released addresses with the key they were released from
    pub released: BTreeMap<Ipv4Addr, String>,
    /// Addresses left alone, with their latest known key (`""` when unallocated)
    pub unreleased: BTreeMap<Ipv4Addr, String>,
}

/// A batch release stopped by a backend error
///
/// `outcome.released` holds everything released before the failure; `outcome.unreleased`
/// holds every address that was not, including those never attempted.
#[derive(Debug, Error)]
#[error("released {} ips before failing, {} left: {source}", outcome.released.len(), outcome.unreleased.len())]
pub struct PartialRelease {
    /// Progress made before the error
    pub outcome: ReleaseOutcome,
    /// The backend error
    #[source]
    pub source: FloatingIpError,
}

/// Release `ip_to_key` across `backends` in order.
///
/// # Errors
///
/// Returns [`PartialRelease`] on the first backend error. Nothing released before the
/// error is rolled back.
pub async fn batch_release(
    ip_to_key: BTreeMap<Ipv4Addr, String>,
    backends: &[Arc<dyn AllocationBackend>],
) -> Result<ReleaseOutcome, PartialRelease> {
    let mut released = BTreeMap::new();
    // pending entries carry the latest key known for the address
    let mut pending = ip_to_key;
    // addresses whose row was found with another owner; never retried on later tables
    let mut settled: BTreeMap<Ipv4Addr, String> = BTreeMap::new();

    for backend in backends {
        if pending.is_empty() {
            break;
        }
        let ips: Vec<Ipv4Addr> = pending.keys().copied().collect();
        let records = match backend.lookup_by_ip_set(&ips).await {
            Ok(records) => records,
            Err(e) => return Err(fail(released, pending, settled, e)),
        };
        for record in records {
            let Some(expected) = pending.get(&record.ip) else {
                continue;
            };
            if *expected != record.key {
                debug!(
                    "Not releasing {} from {}: expected key {}, found {:?}",
                    record.ip,
                    backend.name(),
                    expected,
                    record.key
                );
                pending.remove(&record.ip);
                settled.insert(record.ip, record.key);
                continue;
            }
            match release_one(backend.as_ref(), &record).await {
                Ok(()) => {
                    info!("Released {} from {} in {}", record.ip, record.key, backend.name());
                    pending.remove(&record.ip);
                    released.insert(record.ip, record.key);
                }
                Err(FloatingIpError::StaleOwner { ip, actual, .. }) => {
                    // lost a race between lookup and release
                    pending.remove(&ip);
                    settled.insert(ip, actual);
                }
                Err(e) => return Err(fail(released, pending, settled, e)),
            }
        }
    }

    pending.extend(settled);
    Ok(ReleaseOutcome {
        released,
        unreleased: pending,
    })
}

fn fail(
    released: BTreeMap<Ipv4Addr, String>,
    mut pending: BTreeMap<Ipv4Addr, String>,
    settled: BTreeMap<Ipv4Addr, String>,
    source: FloatingIpError,
) -> PartialRelease {
    pending.extend(settled);
    PartialRelease {
        outcome: ReleaseOutcome {
            released,
            unreleased: pending,
        },
        source,
    }
}

async fn release_one(backend: &dyn AllocationBackend, record: &FloatingIpRecord) -> Result<(), FloatingIpError> {
    backend.release(std::slice::from_ref(record)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn map(entries: &[(u8, &str)]) -> BTreeMap<Ipv4Addr, String> {
        entries.iter().map(|(i, k)| (ip(*i), (*k).to_string())).collect()
    }

    #[tokio::test]
    async fn test_batch_release_vector() {
        let b1 = MemoryBackend::new("ip_pool");
        b1.put(ip(1), "k1", "s");
        b1.put(ip(2), "k2.1", "s");
        let b2 = MemoryBackend::new("ip_pool1");
        b2.put(ip(3), "k3", "s");
        let backends: Vec<Arc<dyn AllocationBackend>> = vec![Arc::new(b1.clone()), Arc::new(b2.clone())];

        let outcome = batch_release(map(&[(1, "k1"), (2, "k2"), (3, "k3"), (4, "k4")]), &backends)
            .await
            .unwrap();

        assert_eq!(outcome.released, map(&[(1, "k1"), (3, "k3")]));
        assert_eq!(outcome.unreleased, map(&[(2, "k2.1"), (4, "k4")]));
        assert!(b1.get(ip(1)).unwrap().is_free());
        assert_eq!(b1.get(ip(2)).unwrap().key, "k2.1");
        assert!(b2.get(ip(3)).unwrap().is_free());
    }

    #[tokio::test]
    async fn test_unallocated_row_reports_empty_key() {
        let b1 = MemoryBackend::new("ip_pool");
        b1.put(ip(5), "", "s");
        let backends: Vec<Arc<dyn AllocationBackend>> = vec![Arc::new(b1)];
        let outcome = batch_release(map(&[(5, "k5")]), &backends).await.unwrap();
        assert!(outcome.released.is_empty());
        assert_eq!(outcome.unreleased, map(&[(5, "")]));
    }

    #[tokio::test]
    async fn test_partial_progress_on_failure() {
        let b1 = MemoryBackend::new("ip_pool");
        b1.put(ip(1), "k1", "s");
        b1.put(ip(2), "k2", "s");
        b1.put(ip(3), "k3.1", "s");
        b1.fail_release_on(ip(2));
        let b2 = MemoryBackend::new("ip_pool1");
        b2.put(ip(4), "k4", "s");
        let backends: Vec<Arc<dyn AllocationBackend>> = vec![Arc::new(b1.clone()), Arc::new(b2.clone())];

        let err = batch_release(map(&[(1, "k1"), (2, "k2"), (3, "k3"), (4, "k4")]), &backends)
            .await
            .unwrap_err();

        assert_eq!(err.outcome.released, map(&[(1, "k1")]));
        assert_eq!(err.outcome.unreleased, map(&[(2, "k2"), (3, "k3"), (4, "k4")]));
        assert!(b1.get(ip(1)).unwrap().is_free());
        assert_eq!(b1.get(ip(2)).unwrap().key, "k2");
        // the second table was never attempted
        assert_eq!(b2.get(ip(4)).unwrap().key, "k4");
        assert!(matches!(err.source, FloatingIpError::Database(_)));
    }

    #[tokio::test]
    async fn test_stale_request_never_overwrites() {
        let b1 = MemoryBackend::new("ip_pool");
        b1.put(ip(7), "new-owner", "s");
        let backends: Vec<Arc<dyn AllocationBackend>> = vec![Arc::new(b1.clone())];
        let outcome = batch_release(map(&[(7, "old-owner")]), &backends).await.unwrap();
        assert!(outcome.released.is_empty());
        assert_eq!(b1.get(ip(7)).unwrap().key, "new-owner");
    }
}
