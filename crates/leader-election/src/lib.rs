//! Leader election
//!
//! Mutual exclusion between allocator replicas. The lock is a JSON record in the
//! `control-plane.alpha.kubernetes.io/leader` annotation of a named Endpoints object,
//! written with compare-and-update on the object's `resourceVersion`.
//!
//! ```no_run
//! use leader_election::{ElectionConfig, EndpointsLock, LeaderElector};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(client: kube::Client) -> Result<(), leader_election::ElectionError> {
//! let config = ElectionConfig::from_ttl("galaxy-ipam", "kube-system", 5, "10.0.0.7", 9040);
//! let lock = EndpointsLock::new(client, &config);
//! let elector = LeaderElector::new(config, std::sync::Arc::new(lock))?;
//! let cancel = CancellationToken::new();
//! if elector.acquire(&cancel).await {
//!     elector.renew(&cancel).await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod elector;
pub mod endpoints;
pub mod error;
#[path = "trait.rs"]
pub mod lock_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod record;

pub use config::{ElectionConfig, JITTER_FACTOR};
pub use elector::{LeaderElector, LeaderState};
pub use endpoints::EndpointsLock;
pub use error::ElectionError;
pub use lock_trait::{ObservedRecord, ResourceLock};
pub use record::{LEADER_ANNOTATION, LeaderElectionRecord};
