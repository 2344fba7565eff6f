//! Acquire/renew loop
//!
//! A candidate polls the lock every retry period (jittered) until the lease held by
//! someone else expires, then writes its own record. The leader keeps renewing; if a
//! renewal cannot succeed within the renew deadline, leadership is lost for good and
//! the process is expected to exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ElectionConfig, JITTER_FACTOR};
use crate::error::ElectionError;
use crate::lock_trait::ResourceLock;
use crate::record::LeaderElectionRecord;

/// Where this candidate stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    /// Not started
    Unacquired,
    /// Polling for the lock
    Acquiring,
    /// Holding and renewing the lock
    Leading,
    /// Renewal failed; terminal
    Lost,
}

type LeaderCallback = Arc<dyn Fn(String) + Send + Sync>;
type StoppedCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct Observed {
    record: Option<LeaderElectionRecord>,
    time: Instant,
}

/// Leader elector over a [`ResourceLock`]
pub struct LeaderElector {
    config: ElectionConfig,
    lock: Arc<dyn ResourceLock>,
    observed: Mutex<Observed>,
    reported_leader: Mutex<String>,
    state: watch::Sender<LeaderState>,
    on_new_leader: Option<LeaderCallback>,
    on_stopped_leading: Option<StoppedCallback>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("identity", &self.config.identity)
            .field("lock", &self.lock.describe())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    /// Create an elector.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the timings are inconsistent.
    pub fn new(config: ElectionConfig, lock: Arc<dyn ResourceLock>) -> Result<Self, ElectionError> {
        config.validate()?;
        let (state, _) = watch::channel(LeaderState::Unacquired);
        Ok(Self {
            config,
            lock,
            observed: Mutex::new(Observed {
                record: None,
                time: Instant::now(),
            }),
            reported_leader: Mutex::new(String::new()),
            state,
            on_new_leader: None,
            on_stopped_leading: None,
            stopped: AtomicBool::new(false),
        })
    }

    /// Called (on a spawned task) whenever a different holder is observed
    #[must_use]
    pub fn on_new_leader(mut self, callback: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_new_leader = Some(Arc::new(callback));
        self
    }

    /// Called once when leadership is lost
    #[must_use]
    pub fn on_stopped_leading(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_stopped_leading = Some(Arc::new(callback));
        self
    }

    /// Identity written into the lock
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    /// Observe state transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    /// Whether this candidate holds the lock according to the last observation
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.observed_record()
            .is_some_and(|record| record.holder_identity == self.config.identity)
    }

    /// Holder of the last observed record, if any
    #[must_use]
    pub fn leader(&self) -> Option<String> {
        self.observed_record().map(|record| record.holder_identity)
    }

    fn observed_record(&self) -> Option<LeaderElectionRecord> {
        self.observed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record
            .clone()
    }

    /// Poll until the lock is acquired. Returns `false` if cancelled first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        self.state.send_replace(LeaderState::Acquiring);
        info!(identity = %self.config.identity, lock = %self.lock.describe(), "Attempting to acquire leader lease");
        loop {
            let acquired = self.try_acquire_or_renew().await;
            self.maybe_report_transition();
            if acquired {
                info!(identity = %self.config.identity, "Acquired leader lease");
                self.state.send_replace(LeaderState::Leading);
                return true;
            }
            debug!(identity = %self.config.identity, "Failed to acquire lease");
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(jitter(self.config.retry_period)) => {}
            }
        }
    }

    /// Keep renewing until a renewal misses the renew deadline or `cancel` fires.
    ///
    /// Missing the deadline moves the elector to [`LeaderState::Lost`] and invokes the
    /// stopped callback exactly once. Cancellation returns without touching the state.
    pub async fn renew(&self, cancel: &CancellationToken) {
        loop {
            let attempt = tokio::time::timeout(self.config.renew_deadline, async {
                loop {
                    tokio::time::sleep(self.config.retry_period).await;
                    if self.try_acquire_or_renew().await {
                        return;
                    }
                }
            });
            let renewed = tokio::select! {
                () = cancel.cancelled() => return,
                result = attempt => result.is_ok(),
            };
            self.maybe_report_transition();
            if !renewed {
                error!(identity = %self.config.identity, lock = %self.lock.describe(), "Failed to renew lease, leadership lost");
                self.stop_leading();
                return;
            }
            debug!(identity = %self.config.identity, "Renewed lease");
        }
    }

    /// Acquire then renew until lost or cancelled
    pub async fn run(&self, cancel: &CancellationToken) {
        if self.acquire(cancel).await {
            self.renew(cancel).await;
        }
    }

    /// One attempt to create, take over or extend the lease
    pub async fn try_acquire_or_renew(&self) -> bool {
        match self.attempt().await {
            Ok(acquired) => acquired,
            Err(ElectionError::Conflict(msg)) => {
                debug!(identity = %self.config.identity, %msg, "Lost race for the lock");
                false
            }
            Err(e) => {
                warn!(identity = %self.config.identity, error = %e, "Error retrieving or updating the lock");
                false
            }
        }
    }

    async fn attempt(&self) -> Result<bool, ElectionError> {
        let now = Utc::now();
        let mut desired = LeaderElectionRecord {
            holder_identity: self.config.identity.clone(),
            lease_duration_seconds: self.config.lease_duration.as_secs(),
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
        };

        let Some(current) = self.lock.get().await? else {
            self.lock.create(&desired).await?;
            self.observe(desired);
            return Ok(true);
        };

        let existing = current.record.unwrap_or_else(|| LeaderElectionRecord {
            holder_identity: String::new(),
            ..desired.clone()
        });
        {
            let mut observed = self.observed.lock().unwrap_or_else(PoisonError::into_inner);
            if observed.record.as_ref() != Some(&existing) {
                observed.record = Some(existing.clone());
                observed.time = Instant::now();
            }
            let held_elsewhere = !existing.holder_identity.is_empty()
                && existing.holder_identity != self.config.identity;
            if held_elsewhere && observed.time + self.config.lease_duration > Instant::now() {
                return Ok(false);
            }
        }

        if existing.holder_identity == self.config.identity {
            desired.acquire_time = existing.acquire_time;
            desired.leader_transitions = existing.leader_transitions;
        } else {
            desired.leader_transitions = existing.leader_transitions + 1;
        }

        self.lock.update(&desired, &current.resource_version).await?;
        self.observe(desired);
        Ok(true)
    }

    fn observe(&self, record: LeaderElectionRecord) {
        let mut observed = self.observed.lock().unwrap_or_else(PoisonError::into_inner);
        observed.record = Some(record);
        observed.time = Instant::now();
    }

    fn maybe_report_transition(&self) {
        let Some(holder) = self.leader() else {
            return;
        };
        {
            let mut reported = self.reported_leader.lock().unwrap_or_else(PoisonError::into_inner);
            if *reported == holder {
                return;
            }
            reported.clone_from(&holder);
        }
        info!(identity = %self.config.identity, leader = %holder, "New leader elected");
        if let Some(callback) = &self.on_new_leader {
            let callback = Arc::clone(callback);
            tokio::spawn(async move { callback(holder) });
        }
    }

    fn stop_leading(&self) {
        self.state.send_replace(LeaderState::Lost);
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(callback) = &self.on_stopped_leading {
            callback();
        }
    }
}

/// `period` stretched by a random factor in `[0, JITTER_FACTOR)`
fn jitter(period: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.0..JITTER_FACTOR);
    period + period.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::mock::MemoryLock;

    fn config(identity: &str) -> ElectionConfig {
        let mut config = ElectionConfig::from_ttl("galaxy-ipam", "kube-system", 5, "", 9040);
        config.identity = identity.to_string();
        config
    }

    fn elector(identity: &str, lock: &MemoryLock) -> LeaderElector {
        LeaderElector::new(config(identity), Arc::new(lock.clone())).unwrap()
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = jitter(Duration::from_secs(1));
            assert!(d >= Duration::from_secs(1));
            assert!(d < Duration::from_millis(2200));
        }
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let mut bad = config("a");
        bad.renew_deadline = bad.lease_duration;
        assert!(LeaderElector::new(bad, Arc::new(MemoryLock::new())).is_err());
    }

    #[tokio::test]
    async fn test_first_candidate_creates_lock() {
        let lock = MemoryLock::new();
        let a = elector("a:1", &lock);
        assert!(a.try_acquire_or_renew().await);
        assert!(a.is_leader());
        let record = lock.record().unwrap();
        assert_eq!(record.holder_identity, "a:1");
        assert_eq!(record.lease_duration_seconds, 13);
        assert_eq!(record.leader_transitions, 0);
    }

    #[tokio::test]
    async fn test_exactly_one_of_racing_candidates_wins() {
        let lock = MemoryLock::new();
        let electors: Vec<Arc<LeaderElector>> = (0..8)
            .map(|i| Arc::new(elector(&format!("10.0.0.{i}:9040"), &lock)))
            .collect();

        let handles: Vec<_> = electors
            .iter()
            .map(|e| {
                let e = Arc::clone(e);
                tokio::spawn(async move { e.try_acquire_or_renew().await })
            })
            .collect();
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        // A second round changes nothing while the lease is fresh
        for e in &electors {
            let won = e.try_acquire_or_renew().await;
            assert_eq!(won, e.identity() == lock.record().unwrap().holder_identity);
        }
    }

    #[tokio::test]
    async fn test_renewal_keeps_acquire_time() {
        let lock = MemoryLock::new();
        let a = elector("a:1", &lock);
        assert!(a.try_acquire_or_renew().await);
        let first = lock.record().unwrap();
        assert!(a.try_acquire_or_renew().await);
        let second = lock.record().unwrap();
        assert_eq!(first.acquire_time, second.acquire_time);
        assert!(second.renew_time >= first.renew_time);
        assert_eq!(second.leader_transitions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_takeover_after_lease_expiry() {
        let lock = MemoryLock::new();
        let a = elector("a:1", &lock);
        let b = elector("b:1", &lock);
        assert!(a.try_acquire_or_renew().await);
        assert!(!b.try_acquire_or_renew().await);
        assert_eq!(b.leader().as_deref(), Some("a:1"));

        tokio::time::advance(Duration::from_secs(12)).await;
        assert!(!b.try_acquire_or_renew().await);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(b.try_acquire_or_renew().await);
        let record = lock.record().unwrap();
        assert_eq!(record.holder_identity, "b:1");
        assert_eq!(record.leader_transitions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_callback_fires_once() {
        let lock = MemoryLock::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stopped);
        let a = Arc::new(
            elector("a:1", &lock).on_stopped_leading(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let mut states = a.subscribe();
        let cancel = CancellationToken::new();

        let runner = {
            let a = Arc::clone(&a);
            let cancel = cancel.clone();
            tokio::spawn(async move { a.run(&cancel).await })
        };

        states.wait_for(|s| *s == LeaderState::Leading).await.unwrap();
        lock.set_unavailable(true);
        runner.await.unwrap();

        assert_eq!(a.state(), LeaderState::Lost);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        // Further renew attempts do not report again
        a.renew(&cancel).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_acquiring() {
        let lock = MemoryLock::new();
        let a = elector("a:1", &lock);
        assert!(a.try_acquire_or_renew().await);

        let b = elector("b:1", &lock);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!b.acquire(&cancel).await);
        assert_eq!(b.state(), LeaderState::Acquiring);
    }

    #[tokio::test]
    async fn test_new_leader_callback() {
        let lock = MemoryLock::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let a = elector("a:1", &lock).on_new_leader(move |leader| {
            let _ = tx.send(leader);
        });
        let cancel = CancellationToken::new();
        assert!(a.acquire(&cancel).await);
        assert_eq!(rx.recv().await.as_deref(), Some("a:1"));
    }
}
