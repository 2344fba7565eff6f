//! The lock record stored in the Endpoints annotation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Annotation holding the JSON record
pub const LEADER_ANNOTATION: &str = "control-plane.alpha.kubernetes.io/leader";

/// Who holds the lock and since when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionRecord {
    /// Identity of the holder (`bind:port`)
    pub holder_identity: String,
    /// Lease length granted by the holder
    pub lease_duration_seconds: u64,
    /// When the holder first acquired the lease
    pub acquire_time: DateTime<Utc>,
    /// Last renewal
    pub renew_time: DateTime<Utc>,
    /// Number of times the lease changed hands
    #[serde(default)]
    pub leader_transitions: u32,
}
