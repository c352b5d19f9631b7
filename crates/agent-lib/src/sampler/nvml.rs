//! NVML backed sampler

use super::{Sampler, SamplerError};
use crate::models::{GpuProcess, GpuSnapshot, Snapshot};
use async_trait::async_trait;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Nvml;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Sampler that queries the NVIDIA management library directly.
///
/// The library is loaded lazily on the first sample so the agent can start
/// on nodes where the driver is not ready yet. NVML calls block, so every
/// access to the handle runs on the blocking thread pool.
pub struct NvmlSampler {
    nvml: Arc<Mutex<Option<Nvml>>>,
}

impl NvmlSampler {
    pub fn new() -> Self {
        Self {
            nvml: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `f` against the locked handle on the blocking pool
    async fn with_handle<T, F>(&self, f: F) -> Result<T, SamplerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Option<Nvml>) -> Result<T, SamplerError> + Send + 'static,
    {
        let nvml = Arc::clone(&self.nvml);
        tokio::task::spawn_blocking(move || {
            let mut guard = nvml
                .lock()
                .map_err(|_| SamplerError::Nvml("nvml handle lock poisoned".to_string()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| SamplerError::Nvml(format!("nvml task failed: {e}")))?
    }
}

fn sample_devices(handle: &mut Option<Nvml>) -> Result<Snapshot, SamplerError> {
    if handle.is_none() {
        let nvml = Nvml::init().map_err(|e| SamplerError::Nvml(format!("init failed: {e}")))?;
        info!("NVML initialized");
        *handle = Some(nvml);
    }
    let Some(nvml) = handle.as_ref() else {
        return Err(SamplerError::Nvml("nvml handle missing".to_string()));
    };

    let count = nvml
        .device_count()
        .map_err(|e| SamplerError::Nvml(format!("device count failed: {e}")))?;

    let mut gpus = Vec::with_capacity(count as usize);
    for index in 0..count {
        let device = nvml.device_by_index(index).map_err(|e| {
            SamplerError::Nvml(format!("device handle index={index} failed: {e}"))
        })?;

        let uuid = device.uuid().unwrap_or_default();
        // Unreadable utilization stays unknown so the GPU is never judged idle
        let rates = device.utilization_rates().ok();
        let util_gpu_percent = rates.as_ref().map(|u| u.gpu);
        let util_mem_percent = rates.map(|u| u.memory).unwrap_or(0);
        let (mem_used_bytes, mem_total_bytes) = device
            .memory_info()
            .map(|m| (m.used, m.total))
            .unwrap_or((0, 0));

        let compute_procs = device
            .running_compute_processes()
            .unwrap_or_default()
            .into_iter()
            .map(|p| GpuProcess {
                pid: p.pid,
                used_bytes: match p.used_gpu_memory {
                    UsedGpuMemory::Used(bytes) => bytes,
                    UsedGpuMemory::Unavailable => 0,
                },
            })
            .collect();

        gpus.push(GpuSnapshot {
            index,
            uuid,
            util_gpu_percent,
            util_mem_percent,
            mem_used_bytes,
            mem_total_bytes,
            compute_procs,
        });
    }

    Ok(Snapshot { gpus })
}

impl Default for NvmlSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sampler for NvmlSampler {
    async fn sample(&self) -> Result<Snapshot, SamplerError> {
        self.with_handle(sample_devices).await
    }

    fn close(&self) -> Result<(), SamplerError> {
        let mut guard = self
            .nvml
            .lock()
            .map_err(|_| SamplerError::Nvml("nvml handle lock poisoned".to_string()))?;
        // Dropping the handle shuts the library down
        guard.take();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "nvml"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn test_handle_access_runs_off_the_runtime_thread() {
        let sampler = NvmlSampler::new();
        let runtime_thread = std::thread::current().id();

        let worker = sampler
            .with_handle(|_| Ok(std::thread::current().id()))
            .await
            .unwrap();

        assert_ne!(worker, runtime_thread);
    }

    #[tokio::test]
    async fn test_panicking_handle_task_becomes_error() {
        let sampler = NvmlSampler::new();

        let result: Result<(), _> = sampler
            .with_handle(|_| panic!("driver call aborted"))
            .await;

        assert!(matches!(result, Err(SamplerError::Nvml(_))));
    }

    #[test]
    fn test_close_without_init_is_ok() {
        let sampler = NvmlSampler::new();
        assert!(sampler.close().is_ok());
        assert!(sampler.close().is_ok());
    }
}
