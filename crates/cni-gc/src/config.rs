//! Reaper configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Directories to scan and external endpoints to call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcConfig {
    /// Directories holding address markers
    #[serde(default = "default_ip_dirs")]
    pub ip_dirs: Vec<PathBuf>,
    /// Directories holding per-container network configs
    #[serde(default = "default_config_dirs")]
    pub config_dirs: Vec<PathBuf>,
    /// Address loop period; the config loop runs every three periods
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    /// Docker Engine API base URL
    #[serde(default = "default_runtime_endpoint")]
    pub runtime_endpoint: String,
    /// IPAM recycle endpoint
    #[serde(default)]
    pub recycle_url: String,
    /// Operator name sent with recycle requests
    #[serde(default)]
    pub operator: String,
}

fn default_ip_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/var/lib/cni/networks")]
}

fn default_config_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/var/lib/cni/galaxy")]
}

fn default_interval() -> u64 {
    10
}

fn default_runtime_endpoint() -> String {
    "http://127.0.0.1:2375".to_string()
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            ip_dirs: default_ip_dirs(),
            config_dirs: default_config_dirs(),
            interval_seconds: default_interval(),
            runtime_endpoint: default_runtime_endpoint(),
            recycle_url: String::new(),
            operator: String::new(),
        }
    }
}

impl GcConfig {
    /// Address loop period, at least one second
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    /// Config loop period
    #[must_use]
    pub fn config_interval(&self) -> Duration {
        self.interval() * 3
    }
}
