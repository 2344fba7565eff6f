//! AllocationBackend trait
//!
//! Abstracts one allocation table so the allocator can run against MySQL in
//! production and an in-memory table in tests.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::Result;
use crate::policy::ReleasePolicy;
use crate::record::{Attr, FloatingIpRecord};

/// Operations on one allocation table.
///
/// Rows are created by [`insert_free`](Self::insert_free) and never deleted; the
/// remaining writes only change ownership fields. Every write is conditional on the
/// ownership the caller observed.
#[async_trait::async_trait]
pub trait AllocationBackend: Send + Sync + fmt::Debug {
    /// Table name, used in logs and errors
    fn name(&self) -> &str;

    /// Create the table if it does not exist
    async fn ensure_schema(&self) -> Result<()>;

    /// Insert free rows `(ip, subnet)`; existing rows only get their subnet refreshed.
    ///
    /// Returns the number of rows inserted or touched.
    async fn insert_free(&self, rows: &[(Ipv4Addr, String)]) -> Result<u64>;

    /// Rows for the given addresses; unknown addresses are skipped
    async fn lookup_by_ip_set(&self, ips: &[Ipv4Addr]) -> Result<Vec<FloatingIpRecord>>;

    /// Rows whose key equals `key` (the empty key lists free rows)
    async fn lookup_by_key(&self, key: &str) -> Result<Vec<FloatingIpRecord>>;

    /// Rows whose key starts with `prefix`
    async fn lookup_by_prefix(&self, prefix: &str) -> Result<Vec<FloatingIpRecord>>;

    /// Rows whose key contains `keyword`
    async fn lookup_by_keyword(&self, keyword: &str) -> Result<Vec<FloatingIpRecord>>;

    /// Up to `limit` free rows, restricted to `subnet` when given
    async fn find_free(&self, subnet: Option<&str>, limit: u32) -> Result<Vec<FloatingIpRecord>>;

    /// Claim `ip` for `key` if the row is still free.
    ///
    /// Fails with `Conflict` when another writer owns the row and `NotFound` when the
    /// row does not exist.
    async fn claim(&self, ip: Ipv4Addr, key: &str, policy: ReleasePolicy, attr: &Attr) -> Result<()>;

    /// Move the most recently updated row of `old_key` (within `subnet` when given) to `new_key`.
    ///
    /// Returns the moved address; `NotFound` when `old_key` holds no matching row.
    async fn transfer(
        &self,
        old_key: &str,
        new_key: &str,
        subnet: Option<&str>,
        policy: ReleasePolicy,
        attr: &Attr,
    ) -> Result<Ipv4Addr>;

    /// Rewrite policy and attributes of `ip` if it is still owned by `key`
    async fn update_attr(&self, ip: Ipv4Addr, key: &str, policy: ReleasePolicy, attr: &Attr) -> Result<()>;

    /// Clear ownership of exactly the given rows, each conditional on the row still
    /// carrying the record's key.
    ///
    /// Atomic: any mismatch rolls back the whole call and returns `StaleOwner`.
    async fn release(&self, records: &[FloatingIpRecord]) -> Result<()>;
}
