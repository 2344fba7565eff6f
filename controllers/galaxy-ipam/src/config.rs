//! Configuration file
//!
//! The controller reads one JSON document (path from `GALAXY_IPAM_CONFIG`). Pools are
//! validated at load time so a bad file fails startup instead of the first bind.

use std::path::Path;
use std::time::Duration;

use cni_gc::GcConfig;
use floatingip::{DatabaseConfig, FloatingIpPool, FloatingIpPoolConf};
use leader_election::ElectionConfig;
use serde::{Deserialize, Serialize};

use crate::error::ControllerError;

/// Extended resource pods request to get a floating IP
pub const DEFAULT_RESOURCE_NAME: &str = "tke.cloud.tencent.com/eni-ip";

/// Whole configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Allocator settings
    pub schedule_plugin: PluginConfig,
    /// Listen addresses
    #[serde(default)]
    pub server: ServerConfig,
    /// Leader election
    #[serde(default)]
    pub election: ElectionSettings,
    /// Leaked address reaper; disabled when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gc: Option<GcConfig>,
}

/// `schedule_plugin` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    /// Pools of the primary table
    #[serde(default)]
    pub floatingips: Vec<FloatingIpPoolConf>,
    /// Pools of the second table
    #[serde(default)]
    pub second_floatingips: Vec<FloatingIpPoolConf>,
    /// MySQL connection
    pub database: DatabaseConfig,
    /// Minutes between resyncs
    #[serde(default = "default_resync_interval")]
    pub resync_interval: u64,
    /// Extended resource name
    #[serde(default = "default_resource_name")]
    pub resource_name: String,
    /// Cloud provider base URL, empty to disable
    #[serde(default)]
    pub cloud_provider_addr: String,
}

fn default_resync_interval() -> u64 {
    1
}

fn default_resource_name() -> String {
    DEFAULT_RESOURCE_NAME.to_string()
}

/// `server` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind address of both servers
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Scheduler extender port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Admin API port
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9040
}

fn default_api_port() -> u16 {
    9041
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            api_port: default_api_port(),
        }
    }
}

/// `election` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionSettings {
    /// Run leader election; when false this replica always leads
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Endpoints object holding the lock
    #[serde(default = "default_election_name")]
    pub name: String,
    /// Lease ttl in seconds
    #[serde(default = "default_ttl")]
    pub ttl: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_election_name() -> String {
    "galaxy-ipam".to_string()
}

fn default_ttl() -> u64 {
    5
}

impl Default for ElectionSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            name: default_election_name(),
            ttl: default_ttl(),
        }
    }
}

impl Config {
    /// Read and validate the file at `path`
    pub fn load(path: &Path) -> Result<Self, ControllerError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse and validate a configuration document
    pub fn parse(raw: &str) -> Result<Self, ControllerError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| ControllerError::InvalidConfig(format!("bad config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ControllerError> {
        self.pools()?;
        if self.election.enabled {
            self.election_config("kube-system")
                .validate()
                .map_err(|e| ControllerError::InvalidConfig(e.to_string()))?;
        }
        if let Some(gc) = &self.gc
            && gc.recycle_url.is_empty()
        {
            return Err(ControllerError::InvalidConfig(
                "gc.recycleUrl is required when gc is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Validated pools of the primary and second tables
    pub fn pools(&self) -> Result<(Vec<FloatingIpPool>, Vec<FloatingIpPool>), ControllerError> {
        let primary = FloatingIpPool::from_confs(&self.schedule_plugin.floatingips)?;
        let second = FloatingIpPool::from_confs(&self.schedule_plugin.second_floatingips)?;
        Ok((primary, second))
    }

    /// Election timings for a lock in `namespace`
    pub fn election_config(&self, namespace: &str) -> ElectionConfig {
        ElectionConfig::from_ttl(
            &self.election.name,
            namespace,
            self.election.ttl,
            &self.server.bind,
            self.server.port,
        )
    }

    /// Resync period, at least one minute
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_plugin.resync_interval.max(1) * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "schedule_plugin": {
            "floatingips": [{"nodeSubnets": ["10.49.27.0/24"], "ips": ["10.0.70.2~10.0.70.241"],
                             "subnet": "10.0.70.0/24", "gateway": "10.0.70.1", "vlan": 2}],
            "database": {"protocol": "tcp", "addr": "127.0.0.1:3306", "name": "galaxy"}
        }
    }"#;

    #[test]
    fn test_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.server.port, 9040);
        assert_eq!(config.server.api_port, 9041);
        assert!(config.election.enabled);
        assert_eq!(config.election.ttl, 5);
        assert_eq!(config.schedule_plugin.resource_name, DEFAULT_RESOURCE_NAME);
        assert!(config.schedule_plugin.cloud_provider_addr.is_empty());
        assert!(config.gc.is_none());
        assert_eq!(config.resync_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_resync_interval_has_floor() {
        let mut config = Config::parse(MINIMAL).unwrap();
        config.schedule_plugin.resync_interval = 0;
        assert_eq!(config.resync_interval(), Duration::from_secs(60));
        config.schedule_plugin.resync_interval = 5;
        assert_eq!(config.resync_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_pool_rejected() {
        let raw = MINIMAL.replace("10.0.70.1\"", "10.1.70.1\"");
        assert!(matches!(Config::parse(&raw), Err(ControllerError::Store(_))));
    }

    #[test]
    fn test_invalid_election_rejected() {
        let mut config = Config::parse(MINIMAL).unwrap();
        config.election.name = String::new();
        assert!(matches!(config.validate(), Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_gc_requires_recycle_url() {
        let raw = MINIMAL.trim_end().trim_end_matches('}').to_string() + r#", "gc": {"ipDirs": ["/tmp/ips"]}}"#;
        assert!(matches!(Config::parse(&raw), Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_election_config_from_server() {
        let config = Config::parse(MINIMAL).unwrap();
        let election = config.election_config("kube-system");
        assert_eq!(election.identity, "0.0.0.0:9040");
        assert_eq!(election.lease_duration, Duration::from_secs(13));
    }
}
