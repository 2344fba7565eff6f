//! In-memory ResourceLock for tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::ElectionError;
use crate::lock_trait::{ObservedRecord, ResourceLock};
use crate::record::LeaderElectionRecord;

#[derive(Debug, Default)]
struct Slot {
    record: Option<LeaderElectionRecord>,
    version: u64,
    exists: bool,
}

/// Compare-and-update lock shared by every clone
#[derive(Debug, Clone, Default)]
pub struct MemoryLock {
    slot: Arc<Mutex<Slot>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryLock {
    /// Empty lock; the object does not exist yet
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the API server were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current record
    #[must_use]
    pub fn record(&self) -> Option<LeaderElectionRecord> {
        self.lock().record.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), ElectionError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ElectionError::Kube(kube::Error::Service(
                "memory lock unavailable".into(),
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceLock for MemoryLock {
    fn describe(&self) -> String {
        "memory/lock".to_string()
    }

    async fn get(&self) -> Result<Option<ObservedRecord>, ElectionError> {
        self.check()?;
        let slot = self.lock();
        Ok(slot.exists.then(|| ObservedRecord {
            record: slot.record.clone(),
            resource_version: slot.version.to_string(),
        }))
    }

    async fn create(&self, record: &LeaderElectionRecord) -> Result<(), ElectionError> {
        self.check()?;
        let mut slot = self.lock();
        if slot.exists {
            return Err(ElectionError::Conflict("already exists".to_string()));
        }
        slot.exists = true;
        slot.version += 1;
        slot.record = Some(record.clone());
        Ok(())
    }

    async fn update(&self, record: &LeaderElectionRecord, resource_version: &str) -> Result<(), ElectionError> {
        self.check()?;
        let mut slot = self.lock();
        if !slot.exists || slot.version.to_string() != resource_version {
            return Err(ElectionError::Conflict(format!(
                "version {resource_version} is stale"
            )));
        }
        slot.version += 1;
        slot.record = Some(record.clone());
        Ok(())
    }
}
