/**
 * DAEMON - Wiring of resolver, collectors, store and sockets
 *
 * ROLE :
 * Builds every component from the validated config, binds both sockets,
 * spawns one task per component and coordinates shutdown.
 *
 * DATA FLOW :
 * registration socket --job--> store        (seed summaries)
 *                     --pgid-> resolver     (new root, immediate refresh)
 * resolver --snapshot--> collectors --batch--> store <--copy-- query socket
 *
 * SHUTDOWN :
 * cancellation stops listeners and the resolver; collectors emit their
 * remaining buffer and finalize; the store receives until the last batch
 * sender is gone, then folds everything one final time.
 */

use crate::collectors::{run_collector, Collector, CollectorError, CollectorRegistry};
use crate::config::KernelConfig;
use crate::procs::{HostProcesses, ProcessSource};
use crate::socket::{self, RegistrationSinks};
use crate::store::{MemoryStore, StoreReader};
use crate::tree::TreeResolver;
use std::io;
use std::path::PathBuf;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Collectors(#[from] CollectorError),
    #[error("cannot bind {path}: {source}")]
    Bind { path: PathBuf, source: io::Error },
}

pub struct Daemon {
    config: KernelConfig,
    resolver: TreeResolver,
    collectors: Vec<Box<dyn Collector>>,
    store: MemoryStore,
    registration: UnixListener,
    query: UnixListener,
}

impl Daemon {
    /// Daemon backed by the host process table and the configured collectors
    pub fn new(config: KernelConfig) -> Result<Self, DaemonError> {
        let collectors = CollectorRegistry::with_defaults().build(&config.collectors)?;
        Self::assemble(config, Box::new(HostProcesses::new()), collectors)
    }

    pub fn assemble(
        config: KernelConfig,
        processes: Box<dyn ProcessSource>,
        collectors: Vec<Box<dyn Collector>>,
    ) -> Result<Self, DaemonError> {
        if collectors.is_empty() {
            return Err(CollectorError::NoneAvailable.into());
        }
        let bind = |path: &PathBuf| {
            socket::bind(path).map_err(|source| DaemonError::Bind { path: path.clone(), source })
        };
        let registration = bind(&config.sockets.registration)?;
        let query = bind(&config.sockets.query)?;

        Ok(Self {
            resolver: TreeResolver::new(processes),
            store: MemoryStore::new(config.flush_interval),
            collectors,
            registration,
            query,
            config,
        })
    }

    pub fn reader(&self) -> StoreReader {
        self.store.reader()
    }

    /// Runs until `cancel` fires, then shuts down without losing buffered samples
    pub async fn run(self, cancel: CancellationToken) {
        let Daemon { config, resolver, collectors, store, registration, query } = self;
        let (job_tx, job_rx) = mpsc::channel(config.queue_size);
        let (root_tx, root_rx) = mpsc::channel(config.queue_size);
        let (batch_tx, batch_rx) = mpsc::channel(config.queue_size);

        let reader = store.reader();
        let snapshots = resolver.handle();
        let store_task = tokio::spawn(store.run(job_rx, batch_rx, cancel.clone()));
        let tree_task = tokio::spawn(resolver.run(config.refresh_interval, root_rx, cancel.clone()));

        let collector_tasks: Vec<JoinHandle<()>> = collectors
            .into_iter()
            .map(|collector| {
                tokio::spawn(run_collector(collector, snapshots.clone(), batch_tx.clone(), cancel.clone()))
            })
            .collect();
        // only collectors may keep the batch channel open
        drop(batch_tx);

        let sinks = RegistrationSinks { jobs: job_tx, roots: root_tx };
        let registration_task = tokio::spawn(socket::serve_registrations(
            registration,
            config.sockets.registration.clone(),
            sinks,
            cancel.clone(),
        ));
        let query_task = tokio::spawn(socket::serve_queries(
            query,
            config.sockets.query.clone(),
            reader,
            cancel.clone(),
        ));
        info!(collectors = collector_tasks.len(), "daemon running");

        cancel.cancelled().await;
        info!("shutting down, draining collectors");

        for task in collector_tasks {
            join("collector", task).await;
        }
        join("store", store_task).await;
        join("tree resolver", tree_task).await;
        join("registration listener", registration_task).await;
        join("query listener", query_task).await;
        info!("daemon stopped");
    }
}

async fn join(component: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        error!("{component} task failed: {e}");
    }
}
