//! Election timings

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ElectionError;

/// Maximum jitter applied to the retry period while acquiring
pub const JITTER_FACTOR: f64 = 1.2;

/// Election settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Endpoints object name
    pub name: String,
    /// Endpoints object namespace
    pub namespace: String,
    /// Identity written into the record
    pub identity: String,
    /// How long a lease stays valid without renewal, measured from the last observed change
    pub lease_duration: Duration,
    /// How long the leader keeps retrying a renewal before giving up
    pub renew_deadline: Duration,
    /// Wait between attempts
    pub retry_period: Duration,
    /// Address advertised in the Endpoints subsets
    pub bind: String,
    /// Port advertised in the Endpoints subsets
    pub port: u16,
}

impl ElectionConfig {
    /// Timings derived from `ttl` seconds: lease `ttl + 8s`, renew deadline `ttl + 2s`,
    /// retry every second. The identity is `bind:port`.
    #[must_use]
    pub fn from_ttl(name: &str, namespace: &str, ttl: u64, bind: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            identity: format!("{bind}:{port}"),
            lease_duration: Duration::from_secs(ttl + 8),
            renew_deadline: Duration::from_secs(ttl + 2),
            retry_period: Duration::from_secs(1),
            bind: bind.to_string(),
            port,
        }
    }

    /// Check names and timing invariants.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when a name is empty, `lease_duration <= renew_deadline`
    /// or `renew_deadline <= retry_period * JITTER_FACTOR`.
    pub fn validate(&self) -> Result<(), ElectionError> {
        if self.name.is_empty() || self.namespace.is_empty() {
            return Err(ElectionError::InvalidConfig(
                "name and namespace must not be empty".to_string(),
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(ElectionError::InvalidConfig(
                "leaseDuration must be greater than renewDeadline".to_string(),
            ));
        }
        if self.renew_deadline <= self.retry_period.mul_f64(JITTER_FACTOR) {
            return Err(ElectionError::InvalidConfig(
                "renewDeadline must be greater than retryPeriod*JitterFactor".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the bind address can be advertised (Kubernetes rejects `0.0.0.0`)
    #[must_use]
    pub fn advertises_address(&self) -> bool {
        !self.bind.is_empty() && self.bind != "0.0.0.0"
    }
}
