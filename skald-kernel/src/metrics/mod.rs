//! Raw samples produced by collectors
//!
//! A sample is one observation for one job root:
//! - CPU: summed CPU percent and memory percent of the root's processes
//! - GPU: one device-level reading, tagged with the device index
//!
//! Samples are ephemeral; the store folds them into summaries (see `fold`).

pub mod fold;

use chrono::{DateTime, Utc};
use skald_contracts::Pgid;
use std::collections::BTreeMap;

/// CPU and memory usage of a job at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuReading {
    pub cpu: f64,
    pub memory: f64,
}

/// Device-level GPU reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuReading {
    pub device: u32,
    pub util: f64,
    pub memory_gb: f64,
    pub power_w: f64,
    pub temperature: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Cpu(CpuReading),
    Gpu(GpuReading),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub root: Pgid,
    pub time: DateTime<Utc>,
    pub reading: Reading,
}

impl Sample {
    pub fn cpu(root: Pgid, time: DateTime<Utc>, cpu: f64, memory: f64) -> Self {
        Self { root, time, reading: Reading::Cpu(CpuReading { cpu, memory }) }
    }

    pub fn gpu(root: Pgid, time: DateTime<Utc>, reading: GpuReading) -> Self {
        Self { root, time, reading: Reading::Gpu(reading) }
    }
}

/// Batch emitted by a collector in one flush of its buffer
pub type Batch = Vec<Sample>;

/// Per-root time series, sorted by time (stable, so production order
/// is kept for equal timestamps)
#[derive(Debug, Default)]
pub struct RootSeries {
    pub cpu: Vec<(DateTime<Utc>, CpuReading)>,
    pub gpu: Vec<(DateTime<Utc>, GpuReading)>,
}

pub fn split_by_root(samples: Vec<Sample>) -> BTreeMap<Pgid, RootSeries> {
    let mut series: BTreeMap<Pgid, RootSeries> = BTreeMap::new();
    for sample in samples {
        let entry = series.entry(sample.root).or_default();
        match sample.reading {
            Reading::Cpu(r) => entry.cpu.push((sample.time, r)),
            Reading::Gpu(r) => entry.gpu.push((sample.time, r)),
        }
    }
    for entry in series.values_mut() {
        entry.cpu.sort_by_key(|(time, _)| *time);
        entry.gpu.sort_by_key(|(time, _)| *time);
    }
    series
}
