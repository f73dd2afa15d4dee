/**
 * MEMORY STORE - Running per-job summaries and the query read path
 *
 * ROLE :
 * Single consumer of registration events and collector batches. Batches are
 * buffered and folded into per-root summaries on a flush timer; queries copy
 * summaries out through a `StoreReader`.
 *
 * OPERATION :
 * - register = seed empty cpu/gpu summaries (never overwrites)
 * - ingest = queue a batch until next flush
 * - flush = fold all queued samples under the write lock, in one pass
 * - readers clone under the read lock: a snapshot shows each root either
 *   before or after a flush, never halfway
 * - on shutdown every remaining batch is received and folded before exit
 */

use crate::metrics::fold::{coalesce, Fold};
use crate::metrics::{split_by_root, Batch, Sample};
use crate::state::{new_state, Shared};
use serde_json::Value;
use skald_contracts::messages::FALLBACK_JOB_NAME;
use skald_contracts::{
    CpuSnapshot, CpuSummary, GpuSnapshot, GpuSummary, JobRegistration, MetricKind, Pgid, QueryError,
    QueryRequest,
};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct Summaries {
    pub cpu: CpuSnapshot,
    pub gpu: GpuSnapshot,
}

/// Query side of the store
#[derive(Clone)]
pub struct StoreReader {
    summaries: Shared<Summaries>,
}

impl StoreReader {
    pub fn cpu(&self) -> CpuSnapshot {
        self.summaries.read().cpu.clone()
    }

    pub fn gpu(&self) -> GpuSnapshot {
        self.summaries.read().gpu.clone()
    }

    /// JSON answer to a query; unknown kinds get the error object
    pub fn answer(&self, request: &QueryRequest) -> serde_json::Result<Value> {
        match request.metric_kind() {
            Some(MetricKind::Cpu) => serde_json::to_value(self.cpu()),
            Some(MetricKind::Gpu) => serde_json::to_value(self.gpu()),
            None => serde_json::to_value(QueryError::unknown_type()),
        }
    }
}

pub struct MemoryStore {
    summaries: Shared<Summaries>,
    pending: Vec<Sample>,
    /// Roots seeded from samples before their registration arrived
    provisional: HashSet<Pgid>,
    flush_interval: Duration,
}

impl MemoryStore {
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            summaries: new_state(Summaries::default()),
            pending: Vec::new(),
            provisional: HashSet::new(),
            flush_interval,
        }
    }

    pub fn reader(&self) -> StoreReader {
        StoreReader { summaries: self.summaries.clone() }
    }

    pub fn register(&mut self, job: &JobRegistration) {
        let name = job.display_name();
        let mut summaries = self.summaries.write();
        if self.provisional.remove(&job.pgid) {
            // samples beat the registration: keep their window, take the name
            if let Some(summary) = summaries.cpu.get_mut(&job.pgid) {
                summary.name = name.to_string();
            }
            if let Some(summary) = summaries.gpu.get_mut(&job.pgid) {
                summary.name = name.to_string();
            }
        }
        summaries
            .cpu
            .entry(job.pgid)
            .or_insert_with(|| CpuSummary::new(name, job.start_time));
        summaries
            .gpu
            .entry(job.pgid)
            .or_insert_with(|| GpuSummary::new(name, job.start_time));
        info!(pgid = job.pgid, name, command = %job.command, "job registered");
    }

    pub fn ingest(&mut self, batch: Batch) {
        self.pending.extend(batch);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Fold every queued sample into its summary
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let count = self.pending.len();
        let series = split_by_root(std::mem::take(&mut self.pending));

        let mut summaries = self.summaries.write();
        for (root, series) in series {
            if let Some((first, _)) = series.cpu.first() {
                let summary = summaries.cpu.entry(root).or_insert_with(|| {
                    warn!(pgid = root, "cpu samples for unregistered root");
                    self.provisional.insert(root);
                    CpuSummary::new(FALLBACK_JOB_NAME, *first)
                });
                summary.fold(&series.cpu);
            }
            if !series.gpu.is_empty() {
                let ticks = coalesce(&series.gpu);
                let first = ticks[0].0;
                let summary = summaries.gpu.entry(root).or_insert_with(|| {
                    warn!(pgid = root, "gpu samples for unregistered root");
                    self.provisional.insert(root);
                    GpuSummary::new(FALLBACK_JOB_NAME, first)
                });
                summary.fold(&ticks);
            }
        }
        debug!(samples = count, "store flushed");
    }

    /// Final flush; the store keeps serving its last state to readers
    pub fn close(&mut self) {
        self.flush();
        let summaries = self.summaries.read();
        info!(cpu_jobs = summaries.cpu.len(), gpu_jobs = summaries.gpu.len(), "store closed");
    }

    /// Ingestion loop. After cancellation it keeps receiving until every
    /// collector dropped its sender, then flushes one last time.
    pub async fn run(
        mut self,
        mut registrations: mpsc::Receiver<JobRegistration>,
        mut batches: mpsc::Receiver<Batch>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(job) = registrations.recv() => self.register(&job),
                batch = batches.recv() => match batch {
                    Some(batch) => self.ingest(batch),
                    None => break,
                },
                _ = ticker.tick() => self.flush(),
            }
        }

        while let Ok(job) = registrations.try_recv() {
            self.register(&job);
        }
        while let Some(batch) = batches.recv().await {
            self.ingest(batch);
        }
        debug!(pending = self.pending(), "collectors drained");
        self.close();
    }
}
