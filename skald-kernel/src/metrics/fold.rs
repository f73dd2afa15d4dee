//! Time-weighted incremental fold of samples into running summaries
//!
//! For a summary covering `[start, end)` with average `avg`, folding samples
//! `(t_1, v_1) .. (t_n, v_n)` gives
//!
//! ```text
//! avg' = (avg * (end - start) + Σ v_i * (t_i - t_{i-1})) / (t_n - start)
//! ```
//!
//! with `t_0 = end` (or `start` for a fresh summary). Folding a series in one
//! flush or split over several flushes yields the same result.

use super::{CpuReading, GpuReading};
use chrono::{DateTime, Duration, Utc};
use skald_contracts::{CpuSummary, GpuSummary};
use std::collections::BTreeSet;

/// A summary that absorbs a time-sorted series of readings
pub trait Fold {
    type Reading;

    /// Series must be sorted by time. An empty series is a no-op.
    fn fold(&mut self, series: &[(DateTime<Utc>, Self::Reading)]);
}

pub fn seconds(d: Duration) -> f64 {
    match d.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => d.num_seconds() as f64,
    }
}

/// Visits each reading with the seconds elapsed since the previous one,
/// starting from the current window end. Readings older than the window
/// end cover no time. Returns the new window end.
fn walk<R>(
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    series: &[(DateTime<Utc>, R)],
    mut visit: impl FnMut(&R, f64),
) -> DateTime<Utc> {
    let mut prev = end.unwrap_or(start);
    for (time, reading) in series {
        visit(reading, seconds(*time - prev).max(0.0));
        if *time > prev {
            prev = *time;
        }
    }
    prev
}

impl Fold for CpuSummary {
    type Reading = CpuReading;

    fn fold(&mut self, series: &[(DateTime<Utc>, CpuReading)]) {
        let Some((_, last)) = series.last() else {
            return;
        };
        let prior = seconds(self.elapsed());
        let mut cpu = self.cpu * prior;
        let mut memory = self.memory * prior;

        let end = walk(self.start, self.end, series, |r, dt| {
            cpu += r.cpu * dt;
            memory += r.memory * dt;
        });

        let total = seconds(end - self.start);
        if total > 0.0 {
            self.cpu = cpu / total;
            self.memory = memory / total;
        } else {
            self.cpu = last.cpu;
            self.memory = last.memory;
        }
        self.end = Some(end);
    }
}

/// GPU readings of one root merged per instant (all devices of one tick)
#[derive(Debug, Clone, PartialEq)]
pub struct GpuTick {
    pub util: f64,
    pub memory_gb: f64,
    pub power_w: f64,
    pub temperature: f64,
    pub devices: BTreeSet<u32>,
}

impl GpuTick {
    fn from_reading(r: &GpuReading) -> Self {
        Self {
            util: r.util,
            memory_gb: r.memory_gb,
            power_w: r.power_w,
            temperature: r.temperature,
            devices: BTreeSet::from([r.device]),
        }
    }
}

/// Merges readings sharing a timestamp: utilization averaged, memory and
/// power summed, temperature maxed.
pub fn coalesce(series: &[(DateTime<Utc>, GpuReading)]) -> Vec<(DateTime<Utc>, GpuTick)> {
    let mut ticks: Vec<(DateTime<Utc>, GpuTick, usize)> = Vec::new();
    for (time, reading) in series {
        if let Some((_, tick, count)) = ticks.last_mut().filter(|(t, _, _)| *t == *time) {
            tick.util += reading.util;
            tick.memory_gb += reading.memory_gb;
            tick.power_w += reading.power_w;
            tick.temperature = tick.temperature.max(reading.temperature);
            tick.devices.insert(reading.device);
            *count += 1;
            continue;
        }
        ticks.push((*time, GpuTick::from_reading(reading), 1));
    }
    ticks
        .into_iter()
        .map(|(time, mut tick, count)| {
            tick.util /= count as f64;
            (time, tick)
        })
        .collect()
}

impl Fold for GpuSummary {
    type Reading = GpuTick;

    fn fold(&mut self, series: &[(DateTime<Utc>, GpuTick)]) {
        let Some((_, last)) = series.last() else {
            return;
        };
        let prior = seconds(self.elapsed());
        let mut util = self.avg_util * prior;
        let mut memory = self.avg_memory * prior;
        let mut energy = self.energy;
        let mut max_temp = self.max_temp;
        let mut devices: BTreeSet<u32> = self.devices.iter().copied().collect();

        let end = walk(self.start, self.end, series, |tick, dt| {
            util += tick.util * dt;
            memory += tick.memory_gb * dt;
            energy += tick.power_w * dt / 3600.0;
            max_temp = max_temp.max(tick.temperature);
            devices.extend(tick.devices.iter().copied());
        });

        let total = seconds(end - self.start);
        if total > 0.0 {
            self.avg_util = util / total;
            self.avg_memory = memory / total;
        } else {
            self.avg_util = last.util;
            self.avg_memory = last.memory_gb;
        }
        self.energy = energy;
        self.max_temp = max_temp;
        self.devices = devices.into_iter().collect();
        self.end = Some(end);
    }
}
