//! Floating IP allocation
//!
//! Durable bookkeeping of floating IPv4 addresses handed out to Kubernetes pods:
//!
//! - [`key`]: the composite ownership key stored next to every address
//! - [`pool`]: validated pool configuration (node subnets, ranges, gateway, vlan)
//! - [`store`]: table backends (MySQL, in-memory) and the partitioned store
//! - [`policy`]: release policies and the decision function applied on pod teardown
//! - [`release`]: multi-backend conditional batch release
//! - [`ipam`]: the allocator combining one backend with its pools
//!
//! # Example
//!
//! ```no_run
//! use floatingip::{Ipam, Key, MySqlBackend, ReleasePolicy, Attr};
//! use std::sync::Arc;
//!
//! # async fn example(pool: sqlx::MySqlPool) -> Result<(), floatingip::FloatingIpError> {
//! let backend = Arc::new(MySqlBackend::new(pool, "ip_pool"));
//! let ipam = Ipam::new("primary", backend, Vec::new());
//! ipam.configure().await?;
//!
//! let key = Key::encode(true, "default", "web", "web-7d9c-x2k1", "");
//! let ip = ipam
//!     .allocate_in_subnet(&key, None, ReleasePolicy::Immediate, &Attr::default())
//!     .await?;
//! ipam.release(&key, ip).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod ipam;
pub mod key;
pub mod nets;
pub mod policy;
pub mod pool;
pub mod record;
pub mod release;
pub mod store;

pub use error::{FloatingIpError, Result};
pub use ipam::{FloatingIpInfo, IpInfo, Ipam};
pub use key::{AppType, Key};
pub use nets::IpRange;
pub use policy::{ReleaseDecision, ReleasePolicy, WorkloadState};
pub use pool::{FloatingIpPool, FloatingIpPoolConf};
pub use record::{Attr, FloatingIpRecord};
pub use release::{PartialRelease, ReleaseOutcome, batch_release};
pub use store::mysql::DatabaseConfig;
pub use store::{AllocationBackend, MySqlBackend, PartitionedStore};
#[cfg(any(test, feature = "test-util"))]
pub use store::MemoryBackend;
