//! Leader election errors

use thiserror::Error;

/// Errors that can occur while electing a leader
#[derive(Debug, Error)]
pub enum ElectionError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The lock object changed since it was read
    #[error("Conflict updating lock: {0}")]
    Conflict(String),

    /// The stored record could not be parsed or written
    #[error("Invalid leader election record: {0}")]
    Record(#[from] serde_json::Error),

    /// Election timings or names are inconsistent
    #[error("Invalid election config: {0}")]
    InvalidConfig(String),
}

pub(crate) fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(status) if status.code == code)
}
