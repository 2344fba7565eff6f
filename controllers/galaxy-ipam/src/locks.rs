//! Per-key async locks

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

/// Shards per lock set
const SHARDS: usize = 64;

/// Fixed set of mutexes addressed by key hash.
///
/// Two keys may share a shard; callers must not hold a guard from one set while
/// taking another guard from the same set.
pub struct KeyLocks {
    shards: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Wait for the lock guarding `key`
    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let shard = (hasher.finish() % SHARDS as u64) as usize;
        self.shards[shard].lock().await
    }
}

impl fmt::Debug for KeyLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLocks").field("shards", &self.shards.len()).finish()
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(KeyLocks::new());
        let guard = locks.lock("dp_ns_app_pod-1").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.lock("dp_ns_app_pod-1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[test]
    fn test_debug_shows_shard_count() {
        assert_eq!(format!("{:?}", KeyLocks::new()), "KeyLocks { shards: 64 }");
    }
}
