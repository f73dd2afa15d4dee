/**
 * COLLECTORS - Independently scheduled samplers feeding the store
 *
 * ROLE :
 * Each collector samples one resource domain (cpu, nvidia) for the pids of
 * the current tree snapshot, buffers observations and emits a batch once
 * its buffer reaches the configured size.
 *
 * OPERATION :
 * - CollectorRegistry = constructors keyed by config section name
 * - Collector trait = name / interval / collect / drain / finalize
 * - run_collector = one tokio task per collector; each poll runs on the
 *   blocking pool so a slow device call only delays its own collector
 * - On shutdown the remaining buffer is emitted, then `finalize` runs once
 */

pub mod cpu;
pub mod nvidia;

use crate::config::CollectorSettings;
use crate::metrics::{Batch, Sample};
use crate::tree::{SnapshotHandle, TreeSnapshot};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("GPU telemetry unavailable: {0}")]
    Telemetry(#[from] nvidia::GpuError),
    #[error("no collector could be started")]
    NoneAvailable,
}

/// A sampler for one resource domain
pub trait Collector: Send {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    /// Poll every target once. Returns a batch when the buffer is full.
    fn collect(&mut self, targets: &TreeSnapshot) -> Option<Batch>;

    /// Whatever is still buffered, regardless of the threshold
    fn drain(&mut self) -> Option<Batch>;

    /// Release external resources. Called once, after the last collect.
    fn finalize(&mut self) -> Result<(), CollectorError>;
}

/// Observation buffer shared by collector implementations
#[derive(Debug)]
pub struct SampleBuffer {
    threshold: usize,
    samples: Vec<Sample>,
}

impl SampleBuffer {
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self { threshold, samples: Vec::with_capacity(threshold) }
    }

    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    /// Copies the buffer out once it holds `threshold` observations.
    /// The buffer keeps its allocation.
    pub fn take_if_full(&mut self) -> Option<Batch> {
        if self.samples.len() < self.threshold {
            return None;
        }
        self.take()
    }

    pub fn take(&mut self) -> Option<Batch> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.drain(..).collect())
    }
}

pub type CollectorFactory = fn(&CollectorSettings) -> Result<Box<dyn Collector>, CollectorError>;

/// Catalogue of known collectors, keyed by config section name
pub struct CollectorRegistry {
    factories: BTreeMap<&'static str, CollectorFactory>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self { factories: BTreeMap::new() }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(cpu::SECTION, cpu::build);
        registry.register(nvidia::SECTION, nvidia::build);
        registry
    }

    pub fn register(&mut self, section: &'static str, factory: CollectorFactory) {
        self.factories.insert(section, factory);
    }

    pub fn list(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Builds one collector per configured section. Construction failures
    /// exclude that collector; an empty result is fatal.
    pub fn build(
        &self,
        sections: &BTreeMap<String, CollectorSettings>,
    ) -> Result<Vec<Box<dyn Collector>>, CollectorError> {
        let mut collectors = Vec::new();
        for (section, settings) in sections {
            let Some(factory) = self.factories.get(section.as_str()) else {
                warn!("unknown collector section `{section}`, ignored (known: {:?})", self.list());
                continue;
            };
            match factory(settings) {
                Ok(collector) => {
                    info!(
                        collector = collector.name(),
                        interval = ?collector.interval(),
                        size = settings.size,
                        "collector enabled"
                    );
                    collectors.push(collector);
                }
                Err(e) => error!("collector `{section}` disabled: {e}"),
            }
        }
        if collectors.is_empty() {
            return Err(CollectorError::NoneAvailable);
        }
        Ok(collectors)
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Drives one collector until cancellation, then drains and finalizes it
pub async fn run_collector(
    collector: Box<dyn Collector>,
    targets: SnapshotHandle,
    batches: mpsc::Sender<Batch>,
    cancel: CancellationToken,
) {
    let name = collector.name().to_string();
    let mut ticker = tokio::time::interval(collector.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut slot = Some(collector);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let snapshot = targets.snapshot();
        if snapshot.is_empty() {
            continue;
        }
        let Some(mut collector) = slot.take() else { break };
        let polled = tokio::task::spawn_blocking(move || {
            // a panicking poll still hands the collector back for finalize
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| collector.collect(&snapshot)));
            (collector, outcome)
        })
        .await;

        match polled {
            Ok((collector, Ok(batch))) => {
                slot = Some(collector);
                if let Some(batch) = batch {
                    debug!(collector = %name, samples = batch.len(), "batch emitted");
                    if batches.send(batch).await.is_err() {
                        warn!(collector = %name, "store is gone, stopping collector");
                        break;
                    }
                }
            }
            Ok((collector, Err(_))) => {
                slot = Some(collector);
                error!(collector = %name, "poll panicked, stopping collector");
                break;
            }
            Err(e) => {
                error!(collector = %name, "poll task failed: {e}");
                return;
            }
        }
    }

    let Some(mut collector) = slot else { return };
    if let Some(rest) = collector.drain() {
        debug!(collector = %name, samples = rest.len(), "flushing remaining samples");
        if batches.send(rest).await.is_err() {
            warn!(collector = %name, "store is gone, remaining samples dropped");
        }
    }
    match collector.finalize() {
        Ok(()) => info!(collector = %name, "collector stopped"),
        Err(e) => error!(collector = %name, "finalize failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Reading;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Emits one observation per root per collect
    struct Ticking {
        buffer: SampleBuffer,
        finalized: Arc<AtomicUsize>,
    }

    impl Collector for Ticking {
        fn name(&self) -> &str {
            "ticking"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        fn collect(&mut self, targets: &TreeSnapshot) -> Option<Batch> {
            for root in targets.by_root().keys() {
                self.buffer.push(Sample::cpu(*root, Utc::now(), 1.0, 1.0));
            }
            self.buffer.take_if_full()
        }

        fn drain(&mut self) -> Option<Batch> {
            self.buffer.take()
        }

        fn finalize(&mut self) -> Result<(), CollectorError> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn one_root() -> TreeSnapshot {
        [(42, 42)].into_iter().collect()
    }

    #[test]
    fn test_buffer_waits_for_threshold() {
        let mut collector = Ticking { buffer: SampleBuffer::new(3), finalized: Arc::default() };
        let targets = one_root();

        assert!(collector.collect(&targets).is_none());
        assert!(collector.collect(&targets).is_none());
        let batch = collector.collect(&targets).unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|s| s.root == 42 && matches!(s.reading, Reading::Cpu(_))));
        assert!(collector.buffer.take().is_none());

        // next batch starts from an empty buffer
        assert!(collector.collect(&targets).is_none());
        assert_eq!(collector.drain().map(|b| b.len()), Some(1));
        assert!(collector.drain().is_none());
    }

    #[test]
    fn test_registry_skips_unknown_and_requires_one() {
        let registry = CollectorRegistry::with_defaults();
        assert_eq!(registry.list(), vec!["cpu", "nvidia"]);

        let mut sections = BTreeMap::new();
        sections.insert("disk".to_string(), CollectorSettings { interval: Duration::from_secs(1), size: 1 });
        assert!(matches!(registry.build(&sections), Err(CollectorError::NoneAvailable)));

        sections.insert("cpu".to_string(), CollectorSettings { interval: Duration::from_secs(1), size: 1 });
        let built = registry.build(&sections).unwrap();
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].name(), "cpu");
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_finalizes_once() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let collector = Ticking { buffer: SampleBuffer::new(1000), finalized: finalized.clone() };

        let source = SnapshotHandle::fixed(one_root());
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_collector(Box::new(collector), source, tx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        cancel.cancel();
        task.await.unwrap();

        let batch = rx.recv().await.unwrap();
        assert!(!batch.is_empty());
        assert!(rx.recv().await.is_none());
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    struct Exploding {
        finalized: Arc<AtomicUsize>,
    }

    impl Collector for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        fn collect(&mut self, _targets: &TreeSnapshot) -> Option<Batch> {
            panic!("device vanished mid-poll");
        }

        fn drain(&mut self) -> Option<Batch> {
            None
        }

        fn finalize(&mut self) -> Result<(), CollectorError> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_poll_still_finalizes() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let collector = Exploding { finalized: finalized.clone() };

        let source = SnapshotHandle::fixed(one_root());
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        // stops by itself, without cancellation
        run_collector(Box::new(collector), source, tx, cancel).await;

        assert!(rx.recv().await.is_none());
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_tree_is_not_polled() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let collector = Exploding { finalized: finalized.clone() };

        let source = SnapshotHandle::fixed(TreeSnapshot::default());
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_collector(Box::new(collector), source, tx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }
}
