//! Ownership keys
//!
//! Every allocated row carries a key naming the workload that owns it:
//!
//! ```text
//! dp_<namespace>_<deployment>_<pod>
//! sts_<namespace>_<statefulset>_<pod>
//! tapp_<namespace>_<tapp>_<pod>
//! pool__<pool>_                      (pool reservation)
//! pool__<pool>_dp_<namespace>_<deployment>_<pod>
//! ```
//!
//! `_` is not a valid character in Kubernetes object names, so it is safe as a separator.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FloatingIpError, Result};

/// Key prefix shared by all rows reserved to a pool
pub const POOL_PREFIX: &str = "pool__";

/// Kind of workload owning a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    /// Deployment (or bare ReplicaSet)
    Deployment,
    /// StatefulSet
    StatefulSet,
    /// TApp
    TApp,
}

impl AppType {
    /// Key prefix including the trailing separator
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Deployment => "dp_",
            Self::StatefulSet => "sts_",
            Self::TApp => "tapp_",
        }
    }

    fn strip(s: &str) -> Option<Self> {
        [Self::Deployment, Self::StatefulSet, Self::TApp]
            .into_iter()
            .find(|t| s.starts_with(t.prefix()))
    }

    /// Resolve the app type from a pod owner reference.
    ///
    /// Returns the app type and the app name. ReplicaSet owners are treated as
    /// deployments named after the ReplicaSet up to its last `-`.
    #[must_use]
    pub fn from_owner(kind: &str, owner_name: &str) -> Option<(Self, String)> {
        match kind {
            "StatefulSet" => Some((Self::StatefulSet, owner_name.to_string())),
            "TApp" => Some((Self::TApp, owner_name.to_string())),
            "ReplicaSet" => {
                let app = owner_name
                    .rfind('-')
                    .map_or(owner_name, |idx| &owner_name[..idx]);
                Some((Self::Deployment, app.to_string()))
            }
            _ => None,
        }
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Deployment => "deployment",
            Self::StatefulSet => "statefulset",
            Self::TApp => "tapp",
        };
        f.write_str(s)
    }
}

/// Decoded ownership key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    /// Workload kind; `None` for a bare pool reservation key
    pub app_type: Option<AppType>,
    /// Pod namespace
    pub namespace: String,
    /// Owning workload name
    pub app_name: String,
    /// Pod name; empty for a reservation under the app prefix
    pub pod_name: String,
    /// Pool name from the pod's pool annotation
    pub pool_name: String,
}

impl Key {
    /// Build a key from its parts.
    #[must_use]
    pub fn new(
        app_type: AppType,
        namespace: &str,
        app_name: &str,
        pod_name: &str,
        pool_name: &str,
    ) -> Self {
        Self {
            app_type: Some(app_type),
            namespace: namespace.to_string(),
            app_name: app_name.to_string(),
            pod_name: pod_name.to_string(),
            pool_name: pool_name.to_string(),
        }
    }

    /// Build the key of a pod from its first owner reference.
    ///
    /// # Errors
    ///
    /// Returns `MalformedInput` when the pod has no owner or the owner kind is unsupported.
    pub fn from_owner(
        owner: Option<(&str, &str)>,
        namespace: &str,
        pod_name: &str,
        pool_name: &str,
    ) -> Result<Self> {
        let Some((kind, owner_name)) = owner else {
            return Err(FloatingIpError::MalformedInput(
                "doesn't support pods which does not have parent app".to_string(),
            ));
        };
        let (app_type, app_name) = AppType::from_owner(kind, owner_name)
            .ok_or_else(|| FloatingIpError::MalformedInput(format!("unsupported app type {kind}")))?;
        Ok(Self::new(app_type, namespace, &app_name, pod_name, pool_name))
    }

    /// Encode a key from its parts.
    #[must_use]
    pub fn encode(
        is_deployment: bool,
        namespace: &str,
        app_name: &str,
        pod_name: &str,
        pool_name: &str,
    ) -> String {
        let app_type = if is_deployment {
            AppType::Deployment
        } else {
            AppType::StatefulSet
        };
        Self::new(app_type, namespace, app_name, pod_name, pool_name).to_string()
    }

    /// Decode a stored key.
    ///
    /// # Errors
    ///
    /// Returns `MalformedKey` for the empty key, an unknown type prefix or a wrong field count.
    pub fn decode(raw: &str) -> Result<Self> {
        let malformed = || FloatingIpError::MalformedKey(raw.to_string());
        let mut pool_name = String::new();
        let mut rest = raw;
        if let Some(after) = raw.strip_prefix(POOL_PREFIX) {
            let (pool, tail) = after.split_once('_').ok_or_else(malformed)?;
            pool_name = pool.to_string();
            rest = tail;
            if rest.is_empty() {
                return Ok(Self {
                    app_type: None,
                    namespace: String::new(),
                    app_name: String::new(),
                    pod_name: String::new(),
                    pool_name,
                });
            }
        }
        let app_type = AppType::strip(rest).ok_or_else(malformed)?;
        let parts: Vec<&str> = rest.split('_').collect();
        if parts.len() != 4 {
            return Err(malformed());
        }
        Ok(Self {
            app_type: Some(app_type),
            namespace: parts[1].to_string(),
            app_name: parts[2].to_string(),
            pod_name: parts[3].to_string(),
            pool_name,
        })
    }

    /// Whether the owner is a deployment
    #[must_use]
    pub fn is_deployment(&self) -> bool {
        self.app_type == Some(AppType::Deployment)
    }

    /// Whether the key names a pool
    #[must_use]
    pub fn in_pool(&self) -> bool {
        !self.pool_name.is_empty()
    }

    fn app_prefix(&self) -> String {
        let type_prefix = self.app_type.map_or("", AppType::prefix);
        format!("{type_prefix}{}_{}_", self.namespace, self.app_name)
    }

    /// Prefix shared by every key reserved for the same pool or app.
    ///
    /// `pool__<pool>_` for pool keys, `<type>_<ns>_<app>_` otherwise.
    #[must_use]
    pub fn pool_prefix(&self) -> String {
        if self.in_pool() {
            format!("{POOL_PREFIX}{}_", self.pool_name)
        } else {
            self.app_prefix()
        }
    }

    /// Pool prefix narrowed to this app when the key is in a pool.
    #[must_use]
    pub fn pool_app_prefix(&self) -> String {
        if self.in_pool() {
            format!("{}{}", self.pool_prefix(), self.app_prefix())
        } else {
            self.pool_prefix()
        }
    }

    /// Pod ordinal for StatefulSet and TApp pods (suffix after the last `-`).
    ///
    /// # Errors
    ///
    /// Returns `MalformedInput` if the suffix is not a number.
    pub fn ordinal(&self) -> Result<u32> {
        let suffix = self
            .pod_name
            .rsplit_once('-')
            .map_or(self.pod_name.as_str(), |(_, s)| s);
        suffix.parse().map_err(|_err| {
            FloatingIpError::MalformedInput(format!("invalid pod name {}", self.pod_name))
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut prefix = String::new();
        if self.in_pool() {
            prefix = format!("{POOL_PREFIX}{}_", self.pool_name);
            if self.app_name.is_empty() {
                return f.write_str(&prefix);
            }
        } else if self.app_name.is_empty() && self.namespace.is_empty() {
            return Ok(());
        }
        write!(f, "{prefix}{}{}", self.app_prefix(), self.pod_name)
    }
}
