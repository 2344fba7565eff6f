//! IPv4 helpers: integer conversion and inclusive address ranges.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FloatingIpError;

/// Separator between the first and last address of a range
pub const RANGE_SEPARATOR: char = '~';

/// Big-endian integer of the dotted quad
#[must_use]
pub fn ip_to_int(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

/// Inverse of [`ip_to_int`]
#[must_use]
pub fn int_to_ip(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value)
}

/// Continuous run of addresses, first and last included
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    /// First address
    pub first: Ipv4Addr,
    /// Last address
    pub last: Ipv4Addr,
}

impl IpRange {
    /// Range holding a single address
    #[must_use]
    pub fn single(ip: Ipv4Addr) -> Self {
        Self { first: ip, last: ip }
    }

    /// Number of addresses in the range
    #[must_use]
    pub fn size(&self) -> u32 {
        ip_to_int(self.last) - ip_to_int(self.first) + 1
    }

    /// Whether `ip` lies in the range
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (self.first..=self.last).contains(&ip)
    }

    /// Every address in the range in ascending order
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        (ip_to_int(self.first)..=ip_to_int(self.last)).map(int_to_ip)
    }
}

impl FromStr for IpRange {
    type Err = FloatingIpError;

    /// Parses `a.b.c.d~e.f.g.h` or a single address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FloatingIpError::InvalidPool(format!("invalid ip range {s}"));
        let (first, last) = match s.split_once(RANGE_SEPARATOR) {
            Some((first, last)) => (first, last),
            None => (s, s),
        };
        let first: Ipv4Addr = first.trim().parse().map_err(|_err| invalid())?;
        let last: Ipv4Addr = last.trim().parse().map_err(|_err| invalid())?;
        if first > last {
            return Err(invalid());
        }
        Ok(Self { first, last })
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}{RANGE_SEPARATOR}{}", self.first, self.last)
        }
    }
}

impl Serialize for IpRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
