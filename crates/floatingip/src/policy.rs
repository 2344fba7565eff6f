//! Release policies
//!
//! Decides what happens to a pod's address when the pod goes away. The decision is
//! a pure function of the key, the policy recorded at bind time, the state of the
//! owning workload and how many addresses are held under the workload's prefix.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FloatingIpError, Result};
use crate::key::{AppType, Key};

/// Pod annotation selecting the release policy
pub const RELEASE_POLICY_ANNOTATION: &str = "k8s.v1.cni.galaxy.io/release-policy";

/// Pod annotation selecting a pool
pub const POOL_ANNOTATION: &str = "k8s.v1.cni.galaxy.io/pool";

/// When an allocated address goes back to the free list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ReleasePolicy {
    /// Release as soon as the pod is deleted
    #[default]
    Immediate = 0,
    /// Release only when the workload is deleted or scaled down
    Immutable = 1,
    /// Never release
    Never = 2,
}

impl ReleasePolicy {
    /// Policy of a pod from its annotations; pods in a pool are always `Never`.
    #[must_use]
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        if annotations.get(POOL_ANNOTATION).is_some_and(|p| !p.is_empty()) {
            return Self::Never;
        }
        annotations
            .get(RELEASE_POLICY_ANNOTATION)
            .map_or(Self::Immediate, |v| Self::from_name(v))
    }

    /// Parse the annotation value; anything unknown is `Immediate`
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "immutable" => Self::Immutable,
            "never" => Self::Never,
            _ => Self::Immediate,
        }
    }

    /// Annotation value of the policy (empty for `Immediate`)
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Immediate => "",
            Self::Immutable => "immutable",
            Self::Never => "never",
        }
    }
}

impl TryFrom<u16> for ReleasePolicy {
    type Error = FloatingIpError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(Self::Immediate),
            1 => Ok(Self::Immutable),
            2 => Ok(Self::Never),
            other => Err(FloatingIpError::MalformedInput(format!("unknown release policy {other}"))),
        }
    }
}

impl fmt::Display for ReleasePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// State of the workload owning a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadState {
    /// The workload no longer exists
    Missing,
    /// The workload exists with this many desired replicas
    Replicas(u32),
    /// The workload could not be looked up
    Unknown,
}

/// What to do with an address whose pod went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseDecision {
    /// Return the address to the free list
    Release {
        /// Why
        reason: &'static str,
    },
    /// Move the address to `key`, clearing pod attributes
    Reserve {
        /// Key to reserve under; may equal the current key
        key: String,
        /// Why
        reason: String,
    },
    /// Leave the row untouched
    Keep,
}

const DELETED_IP_MUTABLE: &str = "deleted and ip mutable pod";
const DELETED_SCALED_DOWN_DP: &str = "deleted and scaled down deployment pod";
const DELETED_SCALED_DOWN_APP: &str = "deleted and scaled down app pod";
const DELETED_PARENT_MISSING: &str = "deleted and parent app not exist pod";

/// Decide the fate of `key`'s address.
///
/// `allocated_in_prefix` is the number of rows held under `key.pool_prefix()`; it only
/// matters for deployments with the `Immutable` policy.
///
/// # Errors
///
/// Returns `MalformedInput` when a StatefulSet or TApp pod name carries no numeric ordinal.
pub fn decide(
    key: &Key,
    policy: ReleasePolicy,
    workload: WorkloadState,
    allocated_in_prefix: usize,
) -> Result<ReleaseDecision> {
    let raw = key.to_string();
    match key.app_type {
        Some(AppType::Deployment) => Ok(decide_deployment(&raw, &key.pool_prefix(), policy, workload, allocated_in_prefix)),
        Some(AppType::StatefulSet | AppType::TApp) => decide_ordered(key, &raw, policy, workload),
        None => Ok(ReleaseDecision::Keep),
    }
}

fn reserve_or_keep(raw: &str, prefix: &str, reason: String) -> ReleaseDecision {
    if raw == prefix {
        ReleaseDecision::Keep
    } else {
        ReleaseDecision::Reserve {
            key: prefix.to_string(),
            reason,
        }
    }
}

fn decide_deployment(
    raw: &str,
    prefix: &str,
    policy: ReleasePolicy,
    workload: WorkloadState,
    allocated: usize,
) -> ReleaseDecision {
    match policy {
        ReleasePolicy::Immediate => ReleaseDecision::Release { reason: DELETED_IP_MUTABLE },
        ReleasePolicy::Never => reserve_or_keep(raw, prefix, "never release policy".to_string()),
        ReleasePolicy::Immutable => match workload {
            WorkloadState::Missing | WorkloadState::Replicas(0) => {
                ReleaseDecision::Release { reason: DELETED_IP_MUTABLE }
            }
            WorkloadState::Replicas(replicas) if allocated > replicas as usize => {
                ReleaseDecision::Release { reason: DELETED_SCALED_DOWN_DP }
            }
            WorkloadState::Replicas(replicas) => reserve_or_keep(
                raw,
                prefix,
                format!("allocated {allocated} <= replicas {replicas}"),
            ),
            WorkloadState::Unknown => reserve_or_keep(raw, prefix, "deployment state unknown".to_string()),
        },
    }
}

fn decide_ordered(key: &Key, raw: &str, policy: ReleasePolicy, workload: WorkloadState) -> Result<ReleaseDecision> {
    let keep = |reason: &str| ReleaseDecision::Reserve {
        key: raw.to_string(),
        reason: reason.to_string(),
    };
    Ok(match policy {
        ReleasePolicy::Immediate => ReleaseDecision::Release { reason: DELETED_IP_MUTABLE },
        ReleasePolicy::Never => keep("never policy"),
        ReleasePolicy::Immutable => match workload {
            WorkloadState::Unknown => keep("immutable policy"),
            WorkloadState::Missing => ReleaseDecision::Release { reason: DELETED_PARENT_MISSING },
            WorkloadState::Replicas(replicas) => {
                if key.ordinal()? >= replicas {
                    ReleaseDecision::Release { reason: DELETED_SCALED_DOWN_APP }
                } else {
                    keep("immutable policy")
                }
            }
        },
    })
}
