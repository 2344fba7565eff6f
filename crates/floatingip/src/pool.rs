//! Floating IP pool configuration
//!
//! Pools are declared in the `floatingips` section of the configuration file. Each
//! entry lists the node subnets it serves, the address ranges handed to pods and the
//! container-side subnet, gateway and vlan.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{FloatingIpError, Result};
use crate::nets::{IpRange, ip_to_int};

/// Pool entry as written in the configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloatingIpPoolConf {
    /// Node subnets whose nodes may use this pool
    #[serde(default)]
    pub node_subnets: Vec<Ipv4Net>,
    /// Deprecated single node subnet, wins over `node_subnets` when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routable_subnet: Option<Ipv4Net>,
    /// Address ranges (`a~b` or `a`)
    #[serde(default)]
    pub ips: Vec<String>,
    /// Container subnet
    pub subnet: Option<Ipv4Net>,
    /// Container gateway
    pub gateway: Option<Ipv4Addr>,
    /// Vlan id, 0 when untagged
    #[serde(default, skip_serializing_if = "is_zero")]
    pub vlan: u16,
}

#[allow(clippy::trivially_copy_pass_by_ref, reason = "serde skip_serializing_if signature")]
fn is_zero(v: &u16) -> bool {
    *v == 0
}

/// Validated pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloatingIpPool {
    /// Node subnets, deduplicated and masked
    pub node_subnets: Vec<Ipv4Net>,
    /// Address ranges in ascending order
    pub ranges: Vec<IpRange>,
    /// Container gateway
    pub gateway: Ipv4Addr,
    /// Container subnet
    pub subnet: Ipv4Net,
    /// Vlan id
    pub vlan: u16,
}

impl FloatingIpPool {
    /// Subnet tag stored on every row of this pool
    #[must_use]
    pub fn subnet_tag(&self) -> String {
        self.node_subnets
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Whether `ip` lies in one of the ranges
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.ranges.iter().any(|r| r.contains(ip))
    }

    /// Total number of addresses
    #[must_use]
    pub fn size(&self) -> u32 {
        self.ranges.iter().map(IpRange::size).sum()
    }

    /// Every address of the pool
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.ranges.iter().flat_map(IpRange::iter)
    }

    /// Validate a list of pool entries and order them by gateway.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn from_confs(confs: &[FloatingIpPoolConf]) -> Result<Vec<Self>> {
        let mut pools = confs
            .iter()
            .cloned()
            .map(Self::try_from)
            .collect::<Result<Vec<_>>>()?;
        pools.sort_by_key(|p| ip_to_int(p.gateway));
        Ok(pools)
    }
}

impl TryFrom<FloatingIpPoolConf> for FloatingIpPool {
    type Error = FloatingIpError;

    fn try_from(conf: FloatingIpPoolConf) -> Result<Self> {
        let node_subnets = if let Some(routable) = conf.routable_subnet {
            vec![routable.trunc()]
        } else {
            let mut subnets: Vec<Ipv4Net> = Vec::new();
            for net in conf.node_subnets.iter().map(Ipv4Net::trunc) {
                if !subnets.contains(&net) {
                    subnets.push(net);
                }
            }
            subnets
        };
        if node_subnets.is_empty() {
            return Err(FloatingIpError::InvalidPool("node subnet is empty".to_string()));
        }
        let gateway = conf
            .gateway
            .ok_or_else(|| FloatingIpError::InvalidPool("gateway is empty".to_string()))?;
        let subnet = conf
            .subnet
            .ok_or_else(|| FloatingIpError::InvalidPool("subnet is empty".to_string()))?;
        let ranges = conf
            .ips
            .iter()
            .map(|s| s.parse::<IpRange>())
            .collect::<Result<Vec<_>>>()?;

        let container_net = Ipv4Net::new(gateway, subnet.prefix_len())
            .map_err(|e| FloatingIpError::InvalidPool(e.to_string()))?
            .trunc();
        for (i, range) in ranges.iter().enumerate() {
            if !container_net.contains(&range.first) || !container_net.contains(&range.last) {
                return Err(FloatingIpError::InvalidPool(format!(
                    "ip range {range} not in subnet {container_net}"
                )));
            }
            if i > 0 {
                let prev = ranges[i - 1];
                if u64::from(ip_to_int(range.first)) <= u64::from(ip_to_int(prev.last)) + 1 {
                    return Err(FloatingIpError::InvalidPool(format!(
                        "ip range {prev} and {range} can be merge to one or has wrong order"
                    )));
                }
            }
        }

        Ok(Self {
            node_subnets,
            ranges,
            gateway,
            subnet: container_net,
            vlan: conf.vlan,
        })
    }
}
