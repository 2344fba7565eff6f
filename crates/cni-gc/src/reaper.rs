//! Periodic cleanup of leaked CNI state

use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::GcConfig;
use crate::error::{GcError, RuntimeError};
use crate::releaser::{AddressReleaser, HttpReleaser};
use crate::runtime::{ContainerRuntime, DockerRuntime};

/// Deadline for every runtime and IPAM call
const CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Scans marker and config directories and removes entries of vanished containers
#[derive(Clone)]
pub struct Reaper {
    config: GcConfig,
    runtime: Arc<dyn ContainerRuntime>,
    releaser: Arc<dyn AddressReleaser>,
}

impl std::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Reaper {
    /// Reaper over explicit clients
    #[must_use]
    pub fn new(
        config: GcConfig,
        runtime: Arc<dyn ContainerRuntime>,
        releaser: Arc<dyn AddressReleaser>,
    ) -> Self {
        Self {
            config,
            runtime,
            releaser,
        }
    }

    /// Reaper talking to Docker and the recycle URL from `config`
    ///
    /// # Errors
    ///
    /// Returns an error if either HTTP client cannot be built or the recycle URL is empty.
    pub fn from_config(config: GcConfig) -> Result<Self, GcError> {
        let runtime = DockerRuntime::new(&config.runtime_endpoint, CALL_TIMEOUT)?;
        let releaser = HttpReleaser::new(&config.recycle_url, &config.operator, CALL_TIMEOUT)?;
        Ok(Self::new(config, Arc::new(runtime), Arc::new(releaser)))
    }

    /// Run both loops until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        tokio::join!(self.run_addresses(cancel.clone()), self.run_configs(cancel));
    }

    /// Address loop
    pub async fn run_addresses(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    debug!("Starting address cleanup");
                    let released = self.cleanup_addresses().await;
                    if released > 0 {
                        info!("Address cleanup released {} leaked addresses", released);
                    }
                }
            }
        }
        debug!("Address cleanup loop stopped");
    }

    /// Config loop
    pub async fn run_configs(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.config_interval());
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    debug!("Starting config cleanup");
                    let removed = self.cleanup_configs().await;
                    if removed > 0 {
                        info!("Config cleanup removed {} stale files", removed);
                    }
                }
            }
        }
        debug!("Config cleanup loop stopped");
    }

    /// One pass over the marker directories. Returns the number of addresses released.
    pub async fn cleanup_addresses(&self) -> usize {
        let mut released = 0;
        for dir in &self.config.ip_dirs {
            for (name, path) in list_files(dir).await {
                let Ok(ip) = name.parse::<Ipv4Addr>() else {
                    continue;
                };
                let Some(container_id) = read_container_id(&path).await else {
                    continue;
                };
                if !self.container_gone(&container_id).await {
                    continue;
                }
                if let Err(e) = self.releaser.release(ip).await {
                    warn!("Failed to release {} of container {}: {}", ip, container_id, e);
                    continue;
                }
                remove_file(&path, &container_id).await;
                released += 1;
            }
        }
        released
    }

    /// One pass over the config directories. Returns the number of files removed.
    pub async fn cleanup_configs(&self) -> usize {
        let mut removed = 0;
        for dir in &self.config.config_dirs {
            for (container_id, path) in list_files(dir).await {
                if self.container_gone(&container_id).await && remove_file(&path, &container_id).await {
                    removed += 1;
                }
            }
        }
        removed
    }

    async fn container_gone(&self, container_id: &str) -> bool {
        match self.runtime.inspect(container_id).await {
            Ok(_) => false,
            Err(RuntimeError::NotFound(_)) => {
                info!("Container {} not found", container_id);
                true
            }
            Err(e) => {
                warn!("Error inspecting container {}: {}", container_id, e);
                false
            }
        }
    }
}

/// Regular files of `dir` as (name, path). A missing directory yields nothing.
async fn list_files(dir: &Path) -> Vec<(String, PathBuf)> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            error!("Failed to read dir {}: {}", dir.display(), e);
            return Vec::new();
        }
    };
    let mut files = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
                if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
                    files.push((name.to_string(), entry.path()));
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("Failed to list dir {}: {}", dir.display(), e);
                break;
            }
        }
    }
    files
}

/// First line of a marker, which may be followed by `\r\n<ifname>`
async fn read_container_id(path: &Path) -> Option<String> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    let id = content.lines().next()?.trim();
    (!id.is_empty()).then(|| id.to_string())
}

async fn remove_file(path: &Path, container_id: &str) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!("Deleted leaky file {} of container {}", path.display(), container_id);
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Error deleting file {} of container {}: {}", path.display(), container_id, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeReleaser, FakeRuntime};

    fn reaper(ip_dir: &Path, config_dir: &Path, runtime: &FakeRuntime, releaser: &FakeReleaser) -> Reaper {
        let config = GcConfig {
            ip_dirs: vec![ip_dir.to_path_buf()],
            config_dirs: vec![config_dir.to_path_buf()],
            ..GcConfig::default()
        };
        Reaper::new(config, Arc::new(runtime.clone()), Arc::new(releaser.clone()))
    }

    #[tokio::test]
    async fn test_absent_container_marker_released_and_deleted() {
        let ips = tempfile::tempdir().unwrap();
        let configs = tempfile::tempdir().unwrap();
        std::fs::write(ips.path().join("10.0.0.5"), "dead\r\neth0").unwrap();
        std::fs::write(ips.path().join("10.0.0.6"), "alive\neth0").unwrap();

        let runtime = FakeRuntime::new();
        runtime.add("alive", "running");
        let releaser = FakeReleaser::new();
        let reaper = reaper(ips.path(), configs.path(), &runtime, &releaser);

        assert_eq!(reaper.cleanup_addresses().await, 1);
        assert_eq!(releaser.released(), vec![Ipv4Addr::new(10, 0, 0, 5)]);
        assert!(!ips.path().join("10.0.0.5").exists());
        assert!(ips.path().join("10.0.0.6").exists());
    }

    #[tokio::test]
    async fn test_transient_error_leaves_marker() {
        let ips = tempfile::tempdir().unwrap();
        let configs = tempfile::tempdir().unwrap();
        std::fs::write(ips.path().join("10.0.0.5"), "slow").unwrap();

        let runtime = FakeRuntime::new();
        runtime.time_out("slow");
        let releaser = FakeReleaser::new();
        let reaper = reaper(ips.path(), configs.path(), &runtime, &releaser);

        assert_eq!(reaper.cleanup_addresses().await, 0);
        assert!(releaser.released().is_empty());
        assert!(ips.path().join("10.0.0.5").exists());
    }

    #[tokio::test]
    async fn test_refused_release_keeps_marker() {
        let ips = tempfile::tempdir().unwrap();
        let configs = tempfile::tempdir().unwrap();
        std::fs::write(ips.path().join("10.0.0.5"), "dead").unwrap();

        let runtime = FakeRuntime::new();
        let releaser = FakeReleaser::new();
        releaser.refuse(Ipv4Addr::new(10, 0, 0, 5));
        let reaper = reaper(ips.path(), configs.path(), &runtime, &releaser);

        assert_eq!(reaper.cleanup_addresses().await, 0);
        assert!(ips.path().join("10.0.0.5").exists());
    }

    #[tokio::test]
    async fn test_skips_non_ip_names_empty_markers_and_dirs() {
        let ips = tempfile::tempdir().unwrap();
        let configs = tempfile::tempdir().unwrap();
        std::fs::write(ips.path().join("last_reserved_ip.0"), "10.0.0.9").unwrap();
        std::fs::write(ips.path().join("lock"), "").unwrap();
        std::fs::write(ips.path().join("10.0.0.7"), "").unwrap();
        std::fs::create_dir(ips.path().join("10.0.0.8")).unwrap();

        let runtime = FakeRuntime::new();
        let releaser = FakeReleaser::new();
        let reaper = reaper(ips.path(), configs.path(), &runtime, &releaser);

        assert_eq!(reaper.cleanup_addresses().await, 0);
        assert!(releaser.released().is_empty());
        assert!(ips.path().join("10.0.0.7").exists());
    }

    #[tokio::test]
    async fn test_missing_dirs_are_noop() {
        let runtime = FakeRuntime::new();
        let releaser = FakeReleaser::new();
        let reaper = reaper(
            Path::new("/nonexistent/galaxy/ips"),
            Path::new("/nonexistent/galaxy/configs"),
            &runtime,
            &releaser,
        );
        assert_eq!(reaper.cleanup_addresses().await, 0);
        assert_eq!(reaper.cleanup_configs().await, 0);
    }

    #[tokio::test]
    async fn test_config_files_of_absent_containers_deleted() {
        let ips = tempfile::tempdir().unwrap();
        let configs = tempfile::tempdir().unwrap();
        std::fs::write(configs.path().join("dead"), r#"{"galaxy-k8s-vlan":{}}"#).unwrap();
        std::fs::write(configs.path().join("alive"), r#"{"galaxy-k8s-vlan":{}}"#).unwrap();
        std::fs::write(configs.path().join("slow"), "{}").unwrap();

        let runtime = FakeRuntime::new();
        runtime.add("alive", "running");
        runtime.time_out("slow");
        let releaser = FakeReleaser::new();
        let reaper = reaper(ips.path(), configs.path(), &runtime, &releaser);

        assert_eq!(reaper.cleanup_configs().await, 1);
        assert!(!configs.path().join("dead").exists());
        assert!(configs.path().join("alive").exists());
        assert!(configs.path().join("slow").exists());
        assert!(releaser.released().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let ips = tempfile::tempdir().unwrap();
        let configs = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let releaser = FakeReleaser::new();
        let reaper = reaper(ips.path(), configs.path(), &runtime, &releaser);

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { reaper.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(25)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
