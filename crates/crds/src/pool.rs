//! Pool CRD
//!
//! A named capacity reservation of floating IPs. Allocation records refer to a
//! pool only through the `pool__<name>_` key prefix, so deleting a Pool never
//! touches existing allocations.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Namespace Pool objects live in.
pub const POOL_NAMESPACE: &str = "kube-system";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[kube(
    group = "galaxy.k8s.io",
    version = "v1alpha1",
    kind = "Pool",
    namespaced,
    status = "PoolStatus",
    shortname = "fippool"
)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Maximum number of addresses the pool may hold
    pub size: u32,

    /// Reserve `size` addresses up front under the pool key
    #[serde(default, rename = "preAllocateIP")]
    pub pre_allocate_ip: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    /// Addresses currently held under the pool key prefix
    pub real_pool_size: u32,

    /// Last time pre-allocation ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_allocated: Option<chrono::DateTime<chrono::Utc>>,
}

impl Pool {
    /// Builds a Pool object in [`POOL_NAMESPACE`].
    pub fn named(name: &str, size: u32, pre_allocate_ip: bool) -> Self {
        let mut pool = Pool::new(name, PoolSpec { size, pre_allocate_ip });
        pool.metadata.namespace = Some(POOL_NAMESPACE.to_string());
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn test_pool_spec_wire_names() {
        let spec = PoolSpec { size: 3, pre_allocate_ip: true };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["size"], 3);
        assert_eq!(value["preAllocateIP"], true);

        let parsed: PoolSpec = serde_json::from_str(r#"{"size": 5}"#).unwrap();
        assert_eq!(parsed, PoolSpec { size: 5, pre_allocate_ip: false });
    }

    #[test]
    fn test_pool_named_sets_namespace() {
        let pool = Pool::named("web", 2, false);
        assert_eq!(pool.metadata.name.as_deref(), Some("web"));
        assert_eq!(pool.metadata.namespace.as_deref(), Some(POOL_NAMESPACE));
        assert_eq!(Pool::group(&()), "galaxy.k8s.io");
        assert_eq!(Pool::kind(&()), "Pool");
    }
}
