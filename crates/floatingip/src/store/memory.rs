//! In-memory allocation table for unit tests
//!
//! Mirrors the conditional write semantics of [`MySqlBackend`](super::MySqlBackend)
//! and adds fault injection for the failure paths.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::error::{FloatingIpError, Result};
use crate::policy::ReleasePolicy;
use crate::record::{Attr, FloatingIpRecord};
use crate::store::AllocationBackend;

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<Ipv4Addr, FloatingIpRecord>,
    clock: Option<DateTime<Utc>>,
    missing: bool,
    fail_release: HashSet<Ipv4Addr>,
}

impl Table {
    /// Strictly increasing timestamps so "most recently updated" is deterministic
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.clock {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }
}

/// Mock allocation table
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    name: String,
    table: Arc<Mutex<Table>>,
}

impl MemoryBackend {
    /// Empty table
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: Arc::new(Mutex::new(Table::default())),
        }
    }

    /// Table that reports `TableMissing` on every call
    pub fn missing(name: impl Into<String>) -> Self {
        let backend = Self::new(name);
        backend.lock().missing = true;
        backend
    }

    /// Make `release` fail with a database error whenever it touches `ip`
    pub fn fail_release_on(&self, ip: Ipv4Addr) {
        self.lock().fail_release.insert(ip);
    }

    /// Insert or overwrite a row as-is
    pub fn put(&self, ip: Ipv4Addr, key: &str, subnet: &str) {
        let mut table = self.lock();
        let updated_at = table.tick();
        table.rows.insert(
            ip,
            FloatingIpRecord {
                key: key.to_string(),
                updated_at,
                ..FloatingIpRecord::free(ip, subnet)
            },
        );
    }

    /// Current row of `ip`
    pub fn get(&self, ip: Ipv4Addr) -> Option<FloatingIpRecord> {
        self.lock().rows.get(&ip).cloned()
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    /// Whether the table has no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        // a panicking test thread must not hide the table from the others
        self.table.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn checked(&self) -> Result<std::sync::MutexGuard<'_, Table>> {
        let table = self.lock();
        if table.missing {
            return Err(FloatingIpError::TableMissing(self.name.clone()));
        }
        Ok(table)
    }

    fn filter(&self, pred: impl Fn(&FloatingIpRecord) -> bool) -> Result<Vec<FloatingIpRecord>> {
        let table = self.checked()?;
        Ok(table.rows.values().filter(|r| pred(r)).cloned().collect())
    }
}

fn in_subnet(record: &FloatingIpRecord, subnet: Option<&str>) -> bool {
    subnet.is_none_or(|s| record.node_subnets().any(|n| n == s))
}

#[async_trait::async_trait]
impl AllocationBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.lock().missing = false;
        Ok(())
    }

    async fn insert_free(&self, rows: &[(Ipv4Addr, String)]) -> Result<u64> {
        let mut table = self.checked()?;
        for (ip, subnet) in rows {
            let updated_at = table.tick();
            table
                .rows
                .entry(*ip)
                .and_modify(|r| r.subnet.clone_from(subnet))
                .or_insert_with(|| FloatingIpRecord {
                    updated_at,
                    ..FloatingIpRecord::free(*ip, subnet)
                });
        }
        Ok(rows.len() as u64)
    }

    async fn lookup_by_ip_set(&self, ips: &[Ipv4Addr]) -> Result<Vec<FloatingIpRecord>> {
        self.filter(|r| ips.contains(&r.ip))
    }

    async fn lookup_by_key(&self, key: &str) -> Result<Vec<FloatingIpRecord>> {
        self.filter(|r| r.key == key)
    }

    async fn lookup_by_prefix(&self, prefix: &str) -> Result<Vec<FloatingIpRecord>> {
        self.filter(|r| r.key.starts_with(prefix))
    }

    async fn lookup_by_keyword(&self, keyword: &str) -> Result<Vec<FloatingIpRecord>> {
        self.filter(|r| r.key.contains(keyword))
    }

    async fn find_free(&self, subnet: Option<&str>, limit: u32) -> Result<Vec<FloatingIpRecord>> {
        let table = self.checked()?;
        Ok(table
            .rows
            .values()
            .filter(|r| r.is_free() && in_subnet(r, subnet))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn claim(&self, ip: Ipv4Addr, key: &str, policy: ReleasePolicy, attr: &Attr) -> Result<()> {
        let mut table = self.checked()?;
        let updated_at = table.tick();
        let row = table
            .rows
            .get_mut(&ip)
            .ok_or_else(|| FloatingIpError::NotFound(format!("ip {ip} in {}", self.name)))?;
        if !row.is_free() {
            return Err(FloatingIpError::Conflict(format!("ip {ip} has been allocated by others")));
        }
        row.key = key.to_string();
        row.policy = policy;
        row.attr = attr.clone();
        row.updated_at = updated_at;
        Ok(())
    }

    async fn transfer(
        &self,
        old_key: &str,
        new_key: &str,
        subnet: Option<&str>,
        policy: ReleasePolicy,
        attr: &Attr,
    ) -> Result<Ipv4Addr> {
        let mut table = self.checked()?;
        let updated_at = table.tick();
        let row = table
            .rows
            .values_mut()
            .filter(|r| r.key == old_key && in_subnet(r, subnet))
            .max_by_key(|r| r.updated_at)
            .ok_or_else(|| {
                FloatingIpError::NotFound(format!("no ip of key {old_key} in subnet {}", subnet.unwrap_or("*")))
            })?;
        row.key = new_key.to_string();
        row.policy = policy;
        row.attr = attr.clone();
        row.updated_at = updated_at;
        Ok(row.ip)
    }

    async fn update_attr(&self, ip: Ipv4Addr, key: &str, policy: ReleasePolicy, attr: &Attr) -> Result<()> {
        let mut table = self.checked()?;
        let updated_at = table.tick();
        match table.rows.get_mut(&ip) {
            Some(row) if row.key == key => {
                row.policy = policy;
                row.attr = attr.clone();
                row.updated_at = updated_at;
                Ok(())
            }
            _ => Err(FloatingIpError::NotFound(format!("ip {ip} with key {key}"))),
        }
    }

    async fn release(&self, records: &[FloatingIpRecord]) -> Result<()> {
        let mut table = self.checked()?;
        for record in records {
            if table.fail_release.contains(&record.ip) {
                return Err(FloatingIpError::Database(sqlx::Error::Protocol(format!(
                    "injected failure releasing {}",
                    record.ip
                ))));
            }
            match table.rows.get(&record.ip) {
                Some(row) if row.key == record.key => {}
                Some(row) => {
                    return Err(FloatingIpError::StaleOwner {
                        ip: record.ip,
                        expected: record.key.clone(),
                        actual: row.key.clone(),
                    });
                }
                None => return Err(FloatingIpError::NotFound(format!("ip {} in {}", record.ip, self.name))),
            }
        }
        let updated_at = table.tick();
        for record in records {
            if let Some(row) = table.rows.get_mut(&record.ip) {
                row.key.clear();
                row.policy = ReleasePolicy::Immediate;
                row.attr = Attr::default();
                row.updated_at = updated_at;
            }
        }
        Ok(())
    }
}
