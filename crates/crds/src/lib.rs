//! Galaxy IPAM CRD Definitions
//!
//! Kubernetes Custom Resource Definitions used by galaxy-ipam.

pub mod pool;

pub use pool::*;
