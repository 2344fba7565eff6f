//! Allocation rows

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::policy::ReleasePolicy;

/// Pod attributes stored alongside an allocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Attr {
    /// Node the pod was bound to, needed to unassign through the cloud provider
    #[serde(default)]
    pub node_name: String,
    /// Pod uid, tells a deleting pod from its same-named successor
    #[serde(default)]
    pub uid: String,
}

impl Attr {
    /// Attributes of a pod bound to `node_name`
    #[must_use]
    pub fn new(node_name: &str, uid: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            uid: uid.to_string(),
        }
    }

    /// Encode as the stored JSON blob
    ///
    /// # Errors
    ///
    /// Returns a serialization error.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the stored blob; an empty blob yields default attributes
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed JSON.
    pub fn decode(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(raw)?)
    }
}

/// One row of an allocation table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloatingIpRecord {
    /// Address (primary key)
    pub ip: Ipv4Addr,
    /// Owner key, empty when free
    pub key: String,
    /// Release policy of the current owner
    pub policy: ReleasePolicy,
    /// Owner attributes
    pub attr: Attr,
    /// Comma separated node subnets this address serves
    pub subnet: String,
    /// Last ownership change
    pub updated_at: DateTime<Utc>,
}

impl FloatingIpRecord {
    /// Fresh free row
    #[must_use]
    pub fn free(ip: Ipv4Addr, subnet: &str) -> Self {
        Self {
            ip,
            key: String::new(),
            policy: ReleasePolicy::Immediate,
            attr: Attr::default(),
            subnet: subnet.to_string(),
            updated_at: Utc::now(),
        }
    }

    /// Whether the row has no owner
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.key.is_empty()
    }

    /// Node subnets as a list
    pub fn node_subnets(&self) -> impl Iterator<Item = &str> {
        self.subnet.split(',').filter(|s| !s.is_empty())
    }
}

impl fmt::Display for FloatingIpRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FloatingIP{{ip:{} key:{} policy:{} nodeName:{} podUid:{}}}",
            self.ip, self.key, self.policy as u16, self.attr.node_name, self.attr.uid
        )
    }
}
