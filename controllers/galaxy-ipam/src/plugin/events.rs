//! Pod event loop
//!
//! The pod watcher turns watch events into [`PodEvent`]s; this loop releases the
//! addresses of pods that were removed or finished and records addresses of newly
//! running pods. Failed unbinds are retried a few times and then left to resync.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::FloatingIpPlugin;
use crate::cluster::{finished, pod_name};

/// Retries after a failed unbind
const UNBIND_RETRIES: u32 = 3;

/// Base delay between unbind retries, multiplied by the attempt number
const UNBIND_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A change to a pod
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// The pod appeared
    Added(Pod),
    /// The pod changed
    Updated {
        /// Previous state
        old: Pod,
        /// New state
        new: Pod,
    },
    /// The pod was deleted
    Removed(Pod),
}

/// Consume `events` until cancelled or the sender is dropped
pub async fn run_events(
    plugin: Arc<FloatingIpPlugin>,
    mut events: mpsc::Receiver<PodEvent>,
    cancel: CancellationToken,
) {
    info!("Pod event loop started");
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                dispatch(&plugin, event, &mut tasks);
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!("Pod event task panicked: {}", e);
                }
            }
        }
    }
    // in-flight unbinds finish before the loop returns
    while tasks.join_next().await.is_some() {}
    info!("Pod event loop stopped");
}

fn dispatch(plugin: &Arc<FloatingIpPlugin>, event: PodEvent, tasks: &mut JoinSet<()>) {
    match event {
        PodEvent::Added(pod) => {
            let plugin = plugin.clone();
            tasks.spawn(async move { sync(&plugin, &pod).await });
        }
        PodEvent::Updated { old, new } => {
            let plugin = plugin.clone();
            if !finished(&old) && finished(&new) {
                debug!("Pod {} finished", pod_name(&new));
                tasks.spawn(async move { unbind_with_retry(&plugin, &new).await });
            } else {
                tasks.spawn(async move { sync(&plugin, &new).await });
            }
        }
        PodEvent::Removed(pod) => {
            let plugin = plugin.clone();
            tasks.spawn(async move { unbind_with_retry(&plugin, &pod).await });
        }
    }
}

async fn sync(plugin: &FloatingIpPlugin, pod: &Pod) {
    if let Err(e) = plugin.sync_pod_ip(pod).await {
        warn!("Failed to sync ip of pod {}: {}", pod_name(pod), e);
    }
}

/// Unbind, retrying [`UNBIND_RETRIES`] times with a growing delay
pub async fn unbind_with_retry(plugin: &FloatingIpPlugin, pod: &Pod) {
    let mut attempt = 0;
    loop {
        match plugin.unbind(pod).await {
            Ok(()) => return,
            Err(e) if attempt < UNBIND_RETRIES => {
                attempt += 1;
                warn!("Unbind of pod {} failed (attempt {}): {}", pod_name(pod), attempt, e);
                tokio::time::sleep(UNBIND_RETRY_DELAY * attempt).await;
            }
            Err(e) => {
                error!("Giving up unbind of pod {}, leaving it to resync: {}", pod_name(pod), e);
                return;
            }
        }
    }
}
