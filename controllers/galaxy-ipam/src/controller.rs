//! Main controller implementation.
//!
//! Builds the allocator from the configuration, waits for leadership and then runs
//! every long-lived task under a supervisor:
//!
//! - GC reaper (when configured)
//! - resync loop
//! - pod event loop and pod watcher
//! - admin API server
//! - scheduler extender server
//!
//! Tasks are stopped in reverse start order, so the extender stops taking binds first.
//! Losing leadership stops everything and ends the process with an error.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use cni_gc::Reaper;
use floatingip::store::{PRIMARY_TABLE, SECOND_TABLE};
use floatingip::{Ipam, MySqlBackend};
use futures::future::select_all;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use leader_election::{EndpointsLock, LeaderElector};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{ApiState, api_router};
use crate::cloudprovider::HttpCloudProvider;
use crate::cluster::KubeCluster;
use crate::config::Config;
use crate::error::ControllerError;
use crate::extender::extender_router;
use crate::metrics::Metrics;
use crate::plugin::FloatingIpPlugin;
use crate::plugin::events::run_events;
use crate::pool::PoolManager;
use crate::server::serve;
use crate::watcher::PodWatcher;

/// Capacity of the pod event channel
const EVENT_BUFFER: usize = 1024;

type Task = JoinHandle<Result<(), ControllerError>>;

/// Named tasks, each with its own cancellation token
#[derive(Default)]
struct Supervisor {
    tasks: Vec<(String, CancellationToken, Task)>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tasks.iter().map(|(name, _, _)| name)).finish()
    }
}

impl Supervisor {
    fn spawn<F, Fut>(&mut self, name: &str, run: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), ControllerError>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(cancel.clone()));
        info!("Started {}", name);
        self.tasks.push((name.to_string(), cancel, handle));
    }

    /// Wait for the first task to end on its own and take it out of the set
    async fn first_exit(&mut self) -> (String, Result<(), ControllerError>) {
        if self.tasks.is_empty() {
            return std::future::pending().await;
        }
        let (joined, index, _) = select_all(self.tasks.iter_mut().map(|(_, _, handle)| handle)).await;
        let (name, _, _) = self.tasks.remove(index);
        let result = joined
            .map_err(|e| ControllerError::Watch(format!("{name} panicked: {e}")))
            .and_then(|result| result);
        (name, result)
    }

    /// Cancel and await every task, last started first
    async fn shutdown(mut self) {
        while let Some((name, cancel, handle)) = self.tasks.pop() {
            cancel.cancel();
            match handle.await {
                Ok(Ok(())) => info!("Stopped {}", name),
                Ok(Err(e)) => warn!("{} stopped with error: {}", name, e),
                Err(e) => error!("{} panicked: {}", name, e),
            }
        }
    }
}

/// Main controller for floating IP allocation.
pub struct Controller {
    config: Config,
    namespace: String,
    client: Client,
    plugin: Arc<FloatingIpPlugin>,
    metrics: Metrics,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("namespace", &self.namespace)
            .field("plugin", &self.plugin)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Connects to the database and the API server and prepares the allocator.
    pub async fn new(config: Config, namespace: String) -> Result<Self, ControllerError> {
        info!("Initializing galaxy-ipam");

        let db = config.schedule_plugin.database.connect().await?;
        let (primary_pools, second_pools) = config.pools()?;
        let ipam = Ipam::new(
            PRIMARY_TABLE,
            Arc::new(MySqlBackend::new(db.clone(), PRIMARY_TABLE)),
            primary_pools,
        );
        let second = (!second_pools.is_empty()).then(|| {
            Ipam::new(
                SECOND_TABLE,
                Arc::new(MySqlBackend::new(db, SECOND_TABLE)),
                second_pools,
            )
        });

        let client = Client::try_default().await?;
        let cluster = Arc::new(KubeCluster::new(client.clone()));
        let metrics = Metrics::new()?;

        let mut plugin = FloatingIpPlugin::new(ipam, second, cluster, &config.schedule_plugin.resource_name)
            .with_metrics(metrics.clone());
        let cloud_addr = &config.schedule_plugin.cloud_provider_addr;
        if !cloud_addr.is_empty() {
            info!("Using cloud provider at {}", cloud_addr);
            plugin = plugin.with_cloud_provider(Arc::new(HttpCloudProvider::new(cloud_addr)?));
        }

        Ok(Self {
            config,
            namespace,
            client,
            plugin: Arc::new(plugin),
            metrics,
        })
    }

    /// Runs until a shutdown signal, a task failure or the loss of leadership.
    pub async fn run(self) -> Result<(), ControllerError> {
        let leadership_lost = CancellationToken::new();
        let election_cancel = CancellationToken::new();
        let mut renewal = None;

        if self.config.election.enabled {
            let election = self.config.election_config(&self.namespace);
            let lock = Arc::new(EndpointsLock::new(self.client.clone(), &election));
            let lost = leadership_lost.clone();
            let elector = Arc::new(
                LeaderElector::new(election, lock)?
                    .on_new_leader(|leader| info!("Leader is now {}", leader))
                    .on_stopped_leading(move || lost.cancel()),
            );
            info!("Waiting for leadership as {}", elector.identity());
            let acquired = tokio::select! {
                acquired = elector.acquire(&election_cancel) => acquired,
                () = shutdown_signal() => false,
            };
            if !acquired {
                info!("Shut down before acquiring leadership");
                return Ok(());
            }
            let cancel = election_cancel.clone();
            renewal = Some(tokio::spawn(async move { elector.renew(&cancel).await }));
        } else {
            info!("Leader election disabled, running as leader");
        }

        // tables are written by the leader only
        let result = match self.plugin.configure().await {
            Ok(()) => match self.start() {
                Ok(supervisor) => wait(supervisor, &leadership_lost).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e.into()),
        };

        election_cancel.cancel();
        if let Some(renewal) = renewal
            && let Err(e) = renewal.await
        {
            error!("Lease renewal task panicked: {}", e);
        }
        result
    }

    fn start(&self) -> Result<Supervisor, ControllerError> {
        let mut supervisor = Supervisor::default();

        if let Some(gc) = &self.config.gc {
            let reaper = Reaper::from_config(gc.clone())?;
            supervisor.spawn("gc reaper", |cancel| async move {
                reaper.run(cancel).await;
                Ok(())
            });
        }

        let plugin = self.plugin.clone();
        let interval = self.config.resync_interval();
        supervisor.spawn("resync loop", |cancel| async move {
            plugin.run_resync(interval, cancel).await;
            Ok(())
        });

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let plugin = self.plugin.clone();
        supervisor.spawn("pod event loop", |cancel| async move {
            run_events(plugin, events_rx, cancel).await;
            Ok(())
        });

        let pods: Api<Pod> = Api::all(self.client.clone());
        supervisor.spawn("pod watcher", |cancel| async move {
            PodWatcher::new(pods, events_tx).run(cancel).await;
            Ok(())
        });

        let server = &self.config.server;
        let api = api_router(ApiState {
            plugin: self.plugin.clone(),
            pools: Arc::new(PoolManager::new(self.plugin.clone())),
            metrics: Some(self.metrics.clone()),
        });
        let api_addr = listen_addr(&server.bind, server.api_port)?;
        supervisor.spawn("admin api", move |cancel| serve("admin api", api, api_addr, cancel));

        let extender = extender_router(self.plugin.clone());
        let extender_addr = listen_addr(&server.bind, server.port)?;
        supervisor.spawn("scheduler extender", move |cancel| {
            serve("scheduler extender", extender, extender_addr, cancel)
        });

        Ok(supervisor)
    }
}

async fn wait(mut supervisor: Supervisor, leadership_lost: &CancellationToken) -> Result<(), ControllerError> {
    let result = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
        () = leadership_lost.cancelled() => {
            error!("Leadership lost, stopping");
            Err(ControllerError::LeadershipLost)
        }
        (name, result) = supervisor.first_exit() => {
            error!("{} exited unexpectedly", name);
            result.and(Err(ControllerError::Watch(format!("{name} exited"))))
        }
    };
    supervisor.shutdown().await;
    result
}

fn listen_addr(bind: &str, port: u16) -> Result<SocketAddr, ControllerError> {
    format!("{bind}:{port}")
        .parse()
        .map_err(|e| ControllerError::InvalidConfig(format!("bad listen address {bind}:{port}: {e}")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
