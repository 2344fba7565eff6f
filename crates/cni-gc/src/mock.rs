//! Fake runtime and releaser for tests

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{GcError, RuntimeError};
use crate::releaser::AddressReleaser;
use crate::runtime::{ContainerRuntime, ContainerState};

/// Runtime answering from a map; unknown ids are `NotFound`
#[derive(Debug, Clone, Default)]
pub struct FakeRuntime {
    containers: Arc<Mutex<HashMap<String, String>>>,
    slow: Arc<Mutex<HashSet<String>>>,
}

impl FakeRuntime {
    /// Empty runtime
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container with `status`
    pub fn add(&self, id: &str, status: &str) {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), status.to_string());
    }

    /// Make inspections of `id` time out
    pub fn time_out(&self, id: &str) {
        self.slow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        if self.slow.lock().unwrap_or_else(PoisonError::into_inner).contains(id) {
            return Err(RuntimeError::DeadlineExceeded(id.to_string()));
        }
        let containers = self.containers.lock().unwrap_or_else(PoisonError::into_inner);
        containers
            .get(id)
            .map(|status| ContainerState {
                id: id.to_string(),
                status: status.clone(),
            })
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }
}

/// Releaser recording every address it was asked to release
#[derive(Debug, Clone, Default)]
pub struct FakeReleaser {
    released: Arc<Mutex<Vec<Ipv4Addr>>>,
    refuse: Arc<Mutex<HashSet<Ipv4Addr>>>,
}

impl FakeReleaser {
    /// Releaser accepting everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to release `ip`
    pub fn refuse(&self, ip: Ipv4Addr) {
        self.refuse.lock().unwrap_or_else(PoisonError::into_inner).insert(ip);
    }

    /// Addresses released so far
    #[must_use]
    pub fn released(&self) -> Vec<Ipv4Addr> {
        self.released.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait::async_trait]
impl AddressReleaser for FakeReleaser {
    async fn release(&self, ip: Ipv4Addr) -> Result<(), GcError> {
        if self.refuse.lock().unwrap_or_else(PoisonError::into_inner).contains(&ip) {
            return Err(GcError::Release {
                ip,
                message: "refused".to_string(),
            });
        }
        self.released.lock().unwrap_or_else(PoisonError::into_inner).push(ip);
        Ok(())
    }
}
