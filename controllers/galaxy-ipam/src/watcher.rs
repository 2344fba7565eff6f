//! Pod watcher
//!
//! Streams pod changes from the API server into [`PodEvent`]s. The last seen state of
//! every pod is kept so an update carries both the old and the new object.

use std::collections::HashMap;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube_runtime::{WatchStreamExt, watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::plugin::events::PodEvent;

/// Watches all pods and forwards their changes.
#[derive(Debug)]
pub struct PodWatcher {
    api: Api<Pod>,
    events: mpsc::Sender<PodEvent>,
    cache: PodCache,
}

/// Last seen state of every pod
#[derive(Debug, Default)]
struct PodCache {
    known: HashMap<(String, String), Pod>,
}

impl PodCache {
    fn applied(&mut self, pod: Pod) -> Option<PodEvent> {
        match self.known.insert(id(&pod), pod.clone()) {
            Some(old) if old.metadata.resource_version == pod.metadata.resource_version => None,
            Some(old) => Some(PodEvent::Updated { old, new: pod }),
            None => Some(PodEvent::Added(pod)),
        }
    }

    fn deleted(&mut self, pod: Pod) -> PodEvent {
        self.known.remove(&id(&pod));
        PodEvent::Removed(pod)
    }
}

impl PodWatcher {
    /// Creates a new watcher sending to `events`.
    pub fn new(api: Api<Pod>, events: mpsc::Sender<PodEvent>) -> Self {
        Self {
            api,
            events,
            cache: PodCache::default(),
        }
    }

    /// Starts watching pods until cancelled or the receiver is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Starting Pod watcher");

        let mut stream = watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .boxed();
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!("Pod watch error: {}", e);
                    continue;
                }
                None => break,
            };
            let forward = match event {
                watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => self.cache.applied(pod),
                watcher::Event::Delete(pod) => Some(self.cache.deleted(pod)),
                watcher::Event::Init => {
                    debug!("Pod watcher initialized");
                    None
                }
                watcher::Event::InitDone => {
                    info!("Pod watcher initialization complete, {} pods", self.cache.known.len());
                    None
                }
            };
            if let Some(event) = forward
                && self.events.send(event).await.is_err()
            {
                break;
            }
        }
        info!("Pod watcher stopped");
    }
}

fn id(pod: &Pod) -> (String, String) {
    (
        pod.metadata.namespace.clone().unwrap_or_default(),
        pod.metadata.name.clone().unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::mock::pod;

    fn versioned(version: &str) -> Pod {
        let mut p = pod("ns", "web-1", None, None, &[]);
        p.metadata.resource_version = Some(version.to_string());
        p
    }

    #[test]
    fn test_cache_derives_added_then_updated() {
        let mut cache = PodCache::default();
        assert!(matches!(cache.applied(versioned("1")), Some(PodEvent::Added(_))));
        // relist of an unchanged pod
        assert!(cache.applied(versioned("1")).is_none());
        match cache.applied(versioned("2")) {
            Some(PodEvent::Updated { old, new }) => {
                assert_eq!(old.metadata.resource_version.as_deref(), Some("1"));
                assert_eq!(new.metadata.resource_version.as_deref(), Some("2"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_cache_forgets_deleted_pods() {
        let mut cache = PodCache::default();
        cache.applied(versioned("1"));
        assert!(matches!(cache.deleted(versioned("2")), PodEvent::Removed(_)));
        assert!(matches!(cache.applied(versioned("3")), Some(PodEvent::Added(_))));
    }
}
