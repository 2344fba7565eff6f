//! Floating IP store errors

use std::net::Ipv4Addr;

use thiserror::Error;

/// Errors that can occur while allocating or releasing floating IPs
#[derive(Debug, Error)]
pub enum FloatingIpError {
    /// Database driver error (connection, query, decode)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The backing table does not exist
    #[error("Table does not exist: {0}")]
    TableMissing(String),

    /// No row matches the request
    #[error("Not found: {0}")]
    NotFound(String),

    /// A conditional write observed an owner other than the expected one
    #[error("ip {ip} is owned by {actual:?}, expected {expected:?}")]
    StaleOwner {
        /// Address whose row was checked
        ip: Ipv4Addr,
        /// Key the caller expected to find
        expected: String,
        /// Key currently stored in the row
        actual: String,
    },

    /// Another writer claimed the row first
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No free address left in the requested subnet
    #[error("no enough available ips left")]
    CapacityExhausted,

    /// The key cannot be decoded
    #[error("Malformed key: {0:?}")]
    MalformedKey(String),

    /// Invalid pool configuration
    #[error("Invalid pool: {0}")]
    InvalidPool(String),

    /// Malformed input other than keys (ips, ordinals, ranges)
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Attribute blob serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FloatingIpError {
    /// Whether the error reports a missing table
    #[must_use]
    pub fn is_table_missing(&self) -> bool {
        matches!(self, Self::TableMissing(_))
    }
}

/// Result alias for floating IP operations
pub type Result<T> = std::result::Result<T, FloatingIpError>;
