//! Controller-specific error types.
//!
//! Startup and lifecycle failures of the galaxy-ipam process. Request paths carry
//! their own errors (`PluginError`, `ApiError`).

use cni_gc::GcError;
use crate::cloudprovider::CloudError;
use floatingip::FloatingIpError;
use kube::Error as KubeError;
use leader_election::ElectionError;
use thiserror::Error;

/// Errors that can stop the galaxy-ipam process.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Allocation store error
    #[error("Store error: {0}")]
    Store(#[from] FloatingIpError),

    /// Leader election error
    #[error("Election error: {0}")]
    Election(#[from] ElectionError),

    /// GC setup error
    #[error("GC error: {0}")]
    Gc(#[from] GcError),

    /// Cloud provider client setup error
    #[error("Cloud provider error: {0}")]
    Cloud(#[from] CloudError),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Filesystem or socket error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A supervised task ended on its own
    #[error("Task failed: {0}")]
    Watch(String),

    /// Another replica took over
    #[error("Leadership lost")]
    LeadershipLost,
}
