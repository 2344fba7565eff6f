//! GC errors

use std::net::Ipv4Addr;

use thiserror::Error;

/// Container inspection errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The container does not exist
    #[error("container {0} not found")]
    NotFound(String),

    /// The runtime did not answer in time
    #[error("deadline exceeded inspecting container {0}")]
    DeadlineExceeded(String),

    /// Any other runtime failure
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

impl RuntimeError {
    /// Whether the next pass may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound(_))
    }
}

/// Errors raised by the reaper and its clients
#[derive(Debug, Error)]
pub enum GcError {
    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Container runtime error
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The IPAM backend refused to release an address
    #[error("failed to release {ip}: {message}")]
    Release {
        /// Address that was not released
        ip: Ipv4Addr,
        /// Reason reported by the backend
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}
