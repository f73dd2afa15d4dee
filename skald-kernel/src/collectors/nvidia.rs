//! NVIDIA GPU collector (NVML)
//!
//! Devices are enumerated once at construction; construction fails when NVML
//! cannot be initialised. Per tick and per device the device-level reading is
//! fetched once, then the device's compute processes: every tracked job with
//! at least one process on the device receives the full device reading.

use super::{Collector, CollectorError, SampleBuffer};
use crate::config::CollectorSettings;
use crate::metrics::{Batch, GpuReading, Sample};
use crate::tree::TreeSnapshot;
use chrono::Utc;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use skald_contracts::{Pgid, Pid};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

pub const SECTION: &str = "nvidia";

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("NVML: {0}")]
    Nvml(#[from] NvmlError),
    #[error("NVML handle already released")]
    Released,
}

/// Device-level reading, already in display units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceReading {
    pub util: f64,
    pub memory_gb: f64,
    pub power_w: f64,
    pub temperature: f64,
}

/// GPU telemetry capability
pub trait GpuTelemetry: Send {
    fn device_count(&self) -> u32;

    fn read_device(&self, index: u32) -> Result<DeviceReading, GpuError>;

    /// Pids of the compute processes running on the device
    fn compute_pids(&self, index: u32) -> Result<Vec<Pid>, GpuError>;

    fn shutdown(&mut self) -> Result<(), GpuError>;
}

pub struct NvmlTelemetry {
    nvml: Option<Nvml>,
    devices: u32,
}

impl NvmlTelemetry {
    pub fn init() -> Result<Self, GpuError> {
        let nvml = Nvml::init()?;
        let devices = nvml.device_count()?;
        Ok(Self { nvml: Some(nvml), devices })
    }

    fn nvml(&self) -> Result<&Nvml, GpuError> {
        self.nvml.as_ref().ok_or(GpuError::Released)
    }
}

impl GpuTelemetry for NvmlTelemetry {
    fn device_count(&self) -> u32 {
        self.devices
    }

    fn read_device(&self, index: u32) -> Result<DeviceReading, GpuError> {
        let device = self.nvml()?.device_by_index(index)?;
        let util = device.utilization_rates()?.gpu as f64;
        let memory_gb = device.memory_info()?.used as f64 / BYTES_PER_GB;
        // NVML reports milliwatts
        let power_w = device.power_usage()? as f64 / 1000.0;
        let temperature = device.temperature(TemperatureSensor::Gpu)? as f64;
        Ok(DeviceReading { util, memory_gb, power_w, temperature })
    }

    fn compute_pids(&self, index: u32) -> Result<Vec<Pid>, GpuError> {
        let device = self.nvml()?.device_by_index(index)?;
        let processes = device.running_compute_processes()?;
        Ok(processes.into_iter().filter_map(|p| Pid::try_from(p.pid).ok()).collect())
    }

    fn shutdown(&mut self) -> Result<(), GpuError> {
        match self.nvml.take() {
            Some(nvml) => Ok(nvml.shutdown()?),
            None => Ok(()),
        }
    }
}

pub struct NvidiaCollector {
    interval: Duration,
    buffer: SampleBuffer,
    telemetry: Box<dyn GpuTelemetry>,
    devices: u32,
    finalized: bool,
}

impl NvidiaCollector {
    pub fn new(settings: &CollectorSettings, telemetry: Box<dyn GpuTelemetry>) -> Self {
        let devices = telemetry.device_count();
        Self {
            interval: settings.interval,
            buffer: SampleBuffer::new(settings.size),
            telemetry,
            devices,
            finalized: false,
        }
    }
}

pub fn build(settings: &CollectorSettings) -> Result<Box<dyn Collector>, CollectorError> {
    let telemetry = NvmlTelemetry::init()?;
    debug!(devices = telemetry.device_count(), "NVML initialised");
    Ok(Box::new(NvidiaCollector::new(settings, Box::new(telemetry))))
}

impl Collector for NvidiaCollector {
    fn name(&self) -> &str {
        SECTION
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn collect(&mut self, targets: &TreeSnapshot) -> Option<Batch> {
        let now = Utc::now();
        for index in 0..self.devices {
            let reading = match self.telemetry.read_device(index) {
                Ok(reading) => reading,
                Err(e) => {
                    debug!(device = index, "device read failed: {e}");
                    continue;
                }
            };
            let pids = match self.telemetry.compute_pids(index) {
                Ok(pids) => pids,
                Err(e) => {
                    debug!(device = index, "compute process listing failed: {e}");
                    continue;
                }
            };
            let roots: BTreeSet<Pgid> = pids.into_iter().filter_map(|pid| targets.owner(pid)).collect();
            for root in roots {
                let sample = GpuReading {
                    device: index,
                    util: reading.util,
                    memory_gb: reading.memory_gb,
                    power_w: reading.power_w,
                    temperature: reading.temperature,
                };
                self.buffer.push(Sample::gpu(root, now, sample));
            }
        }
        self.buffer.take_if_full()
    }

    fn drain(&mut self) -> Option<Batch> {
        self.buffer.take()
    }

    fn finalize(&mut self) -> Result<(), CollectorError> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        Ok(self.telemetry.shutdown()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Reading;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeDevice {
        reading: Option<DeviceReading>,
        pids: Vec<Pid>,
    }

    struct FakeGpus {
        devices: Vec<FakeDevice>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl GpuTelemetry for FakeGpus {
        fn device_count(&self) -> u32 {
            self.devices.len() as u32
        }

        fn read_device(&self, index: u32) -> Result<DeviceReading, GpuError> {
            self.devices[index as usize].reading.ok_or(GpuError::Released)
        }

        fn compute_pids(&self, index: u32) -> Result<Vec<Pid>, GpuError> {
            Ok(self.devices[index as usize].pids.clone())
        }

        fn shutdown(&mut self) -> Result<(), GpuError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn reading(util: f64, power_w: f64) -> DeviceReading {
        DeviceReading { util, memory_gb: 3.0, power_w, temperature: 60.0 }
    }

    fn collector(devices: Vec<FakeDevice>, shutdowns: Arc<AtomicUsize>) -> NvidiaCollector {
        let settings = CollectorSettings { interval: Duration::from_secs(1), size: 1 };
        NvidiaCollector::new(&settings, Box::new(FakeGpus { devices, shutdowns }))
    }

    fn gpu_of(sample: &Sample) -> GpuReading {
        match sample.reading {
            Reading::Gpu(r) => r,
            Reading::Cpu(_) => panic!("expected a GPU sample"),
        }
    }

    #[test]
    fn test_jobs_sharing_a_device_each_get_the_reading() {
        let devices = vec![FakeDevice { reading: Some(reading(80.0, 250.0)), pids: vec![101, 201, 999] }];
        let mut gpu = collector(devices, Arc::default());
        let targets: TreeSnapshot = [(101, 100), (201, 200)].into_iter().collect();

        let batch = gpu.collect(&targets).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].root, 100);
        assert_eq!(batch[1].root, 200);
        assert_eq!(gpu_of(&batch[0]).power_w, 250.0);
        assert_eq!(gpu_of(&batch[1]).power_w, 250.0);
    }

    #[test]
    fn test_processes_of_one_job_on_one_device_yield_one_sample() {
        let devices = vec![
            FakeDevice { reading: Some(reading(50.0, 100.0)), pids: vec![101, 102] },
            FakeDevice { reading: Some(reading(70.0, 200.0)), pids: vec![103] },
        ];
        let mut gpu = collector(devices, Arc::default());
        let targets: TreeSnapshot = [(101, 100), (102, 100), (103, 100)].into_iter().collect();

        let batch = gpu.collect(&targets).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(gpu_of(&batch[0]).device, 0);
        assert_eq!(gpu_of(&batch[1]).device, 1);
        assert!(batch.iter().all(|s| s.time == batch[0].time));
    }

    #[test]
    fn test_failing_device_is_skipped() {
        let devices = vec![
            FakeDevice { reading: None, pids: vec![101] },
            FakeDevice { reading: Some(reading(10.0, 50.0)), pids: vec![101] },
        ];
        let mut gpu = collector(devices, Arc::default());
        let targets: TreeSnapshot = [(101, 100)].into_iter().collect();

        let batch = gpu.collect(&targets).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(gpu_of(&batch[0]).device, 1);
    }

    #[test]
    fn test_finalize_releases_once() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let mut gpu = collector(Vec::new(), shutdowns.clone());
        gpu.finalize().unwrap();
        gpu.finalize().unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}
