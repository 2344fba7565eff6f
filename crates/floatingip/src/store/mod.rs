//! Allocation tables
//!
//! One [`AllocationBackend`] per table. [`MySqlBackend`] is the production backend,
//! [`MemoryBackend`] stands in for it in tests. [`PartitionedStore`] fronts the ordered
//! list of tables (`ip_pool`, `ip_pool1`) for reads that span all of them.

#[path = "trait.rs"]
pub mod backend_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod mysql;
pub mod partitioned;

pub use backend_trait::AllocationBackend;
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryBackend;
pub use mysql::MySqlBackend;
pub use partitioned::PartitionedStore;

/// Primary allocation table
pub const PRIMARY_TABLE: &str = "ip_pool";

/// Second allocation table
pub const SECOND_TABLE: &str = "ip_pool1";
