//! GPU telemetry sampling
//!
//! A [`Sampler`] produces a [`Snapshot`] of every GPU on the node together
//! with the compute processes running on it. Two backends are provided:
//! NVML (through `nvml-wrapper`, behind the `nvml` feature) and the
//! `nvidia-smi` command line tool.

#[cfg(feature = "nvml")]
mod nvml;
mod smi;

#[cfg(feature = "nvml")]
pub use nvml::NvmlSampler;
pub use smi::{parse_gpu_rows, parse_process_rows, ProcessRow, SmiSampler};

use crate::models::Snapshot;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use async_trait::async_trait;

/// Errors raised while taking a snapshot
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("nvml: {0}")]
    Nvml(String),

    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{binary} exited with {status}: {stderr}")]
    CommandFailed {
        binary: String,
        status: String,
        stderr: String,
    },

    #[error("{binary} did not finish within {timeout:?}")]
    Timeout { binary: String, timeout: Duration },

    #[error("{binary} produced non UTF-8 output")]
    InvalidOutput { binary: String },

    /// `nvidia-smi` exits non-zero when no compute process is running
    #[error("no running processes")]
    NoRunningProcesses,
}

/// Source of GPU snapshots
#[async_trait]
pub trait Sampler: Send + Sync {
    /// Take a snapshot of all GPUs
    async fn sample(&self) -> Result<Snapshot, SamplerError>;

    /// Release backend resources
    fn close(&self) -> Result<(), SamplerError>;

    /// Backend name used in logs
    fn name(&self) -> &'static str;
}

/// Supported sampler backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    Nvml,
    NvidiaSmi,
}

impl SamplerKind {
    /// Parse a backend name. Anything that is not a recognized spelling of
    /// `nvidia-smi` selects NVML.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "smi" | "nvidia-smi" | "nvidiasmi" => SamplerKind::NvidiaSmi,
            _ => SamplerKind::Nvml,
        }
    }
}

/// Create the sampler for the requested backend
pub fn create_sampler(kind: SamplerKind) -> Arc<dyn Sampler> {
    match kind {
        SamplerKind::NvidiaSmi => Arc::new(SmiSampler::new("nvidia-smi")),
        #[cfg(feature = "nvml")]
        SamplerKind::Nvml => Arc::new(NvmlSampler::new()),
        #[cfg(not(feature = "nvml"))]
        SamplerKind::Nvml => {
            tracing::warn!("Built without NVML support, falling back to nvidia-smi");
            Arc::new(SmiSampler::new("nvidia-smi"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_kind_parse() {
        assert_eq!(SamplerKind::parse("smi"), SamplerKind::NvidiaSmi);
        assert_eq!(SamplerKind::parse(" NVIDIA-SMI "), SamplerKind::NvidiaSmi);
        assert_eq!(SamplerKind::parse("nvidiasmi"), SamplerKind::NvidiaSmi);
        assert_eq!(SamplerKind::parse("nvml"), SamplerKind::Nvml);
        assert_eq!(SamplerKind::parse(""), SamplerKind::Nvml);
        assert_eq!(SamplerKind::parse("something-else"), SamplerKind::Nvml);
    }

    #[test]
    fn test_create_sampler_smi() {
        let sampler = create_sampler(SamplerKind::NvidiaSmi);
        assert_eq!(sampler.name(), "nvidia-smi");
    }
}
