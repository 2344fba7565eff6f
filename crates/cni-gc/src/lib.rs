//! CNI garbage collection
//!
//! CNI plugins leave two kinds of state on a node: address markers (a file named after
//! the IPv4 address whose first line is the owning container id) and per-container
//! network config files (named after the container id). When a container disappears
//! without a clean CNI DEL, that state leaks. The [`Reaper`] walks both and removes
//! entries whose container no longer exists, releasing addresses through the external
//! IPAM first.

pub mod config;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod reaper;
pub mod releaser;
pub mod runtime;

pub use config::GcConfig;
pub use error::{GcError, RuntimeError};
pub use reaper::Reaper;
pub use releaser::{AddressReleaser, HttpReleaser};
pub use runtime::{ContainerRuntime, ContainerState, DockerRuntime};
