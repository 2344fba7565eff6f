//! ResourceLock trait
//!
//! Abstracts the object holding the election record so the elector can be tested
//! without an API server.

use crate::error::ElectionError;
use crate::record::LeaderElectionRecord;

/// Lock state as read from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedRecord {
    /// Parsed record, `None` when the object carries no annotation
    pub record: Option<LeaderElectionRecord>,
    /// Version to compare against on update
    pub resource_version: String,
}

/// Compare-and-update storage for the election record
#[async_trait::async_trait]
pub trait ResourceLock: Send + Sync {
    /// `namespace/name` of the lock, for logs
    fn describe(&self) -> String;

    /// Read the lock; `None` when the object does not exist
    async fn get(&self) -> Result<Option<ObservedRecord>, ElectionError>;

    /// Create the object with `record`; `Conflict` when it already exists
    async fn create(&self, record: &LeaderElectionRecord) -> Result<(), ElectionError>;

    /// Replace the record if the object is still at `resource_version`; `Conflict` otherwise
    async fn update(&self, record: &LeaderElectionRecord, resource_version: &str) -> Result<(), ElectionError>;
}
