//! `nvidia-smi` backed sampler
//!
//! Runs two CSV queries per snapshot:
//! - `--query-gpu` for per-device utilization and memory
//! - `--query-compute-apps` for the compute processes, joined back by GPU uuid

use super::{Sampler, SamplerError};
use crate::models::{GpuProcess, GpuSnapshot, Snapshot};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const GPU_QUERY: &str =
    "--query-gpu=index,uuid,utilization.gpu,utilization.memory,memory.used,memory.total";
const PROCESS_QUERY: &str = "--query-compute-apps=gpu_uuid,pid,used_gpu_memory";
const CSV_FORMAT: &str = "--format=csv,noheader,nounits";

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const MIB: u64 = 1024 * 1024;

/// Compute process row from `--query-compute-apps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRow {
    pub gpu_uuid: String,
    pub pid: u32,
    pub used_bytes: u64,
}

/// Sampler that shells out to `nvidia-smi`
pub struct SmiSampler {
    binary: PathBuf,
    query_timeout: Duration,
}

impl SmiSampler {
    /// Create a sampler for the given binary; an empty path means `nvidia-smi`
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        let mut binary = binary.into();
        if binary.as_os_str().is_empty() {
            binary = PathBuf::from("nvidia-smi");
        }
        Self {
            binary,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    async fn run(&self, query: &str) -> Result<String, SamplerError> {
        let binary = self.binary.display().to_string();
        let mut cmd = Command::new(&self.binary);
        cmd.arg(query).arg(CSV_FORMAT).kill_on_drop(true);

        let output = tokio::time::timeout(self.query_timeout, cmd.output())
            .await
            .map_err(|_| SamplerError::Timeout {
                binary: binary.clone(),
                timeout: self.query_timeout,
            })?
            .map_err(|source| SamplerError::Spawn {
                binary: binary.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            // Some driver versions exit non-zero instead of printing nothing
            if stderr.to_ascii_lowercase().contains("no running") {
                return Err(SamplerError::NoRunningProcesses);
            }
            return Err(SamplerError::CommandFailed {
                binary,
                status: output.status.to_string(),
                stderr,
            });
        }

        String::from_utf8(output.stdout).map_err(|_| SamplerError::InvalidOutput { binary })
    }
}

#[async_trait]
impl Sampler for SmiSampler {
    async fn sample(&self) -> Result<Snapshot, SamplerError> {
        let gpu_output = self.run(GPU_QUERY).await?;
        let mut gpus = parse_gpu_rows(&gpu_output);

        let processes = match self.run(PROCESS_QUERY).await {
            Ok(output) => parse_process_rows(&output),
            Err(SamplerError::NoRunningProcesses) => Vec::new(),
            Err(e) => return Err(e),
        };

        attach_processes(&mut gpus, processes);
        Ok(Snapshot { gpus })
    }

    fn close(&self) -> Result<(), SamplerError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "nvidia-smi"
    }
}

/// Split CSV output into trimmed columns, skipping blank lines
fn csv_rows(output: &str) -> impl Iterator<Item = Vec<&str>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.split(',').map(str::trim).collect())
}

/// Parse `--query-gpu` output. Memory columns are MiB and converted to bytes.
pub fn parse_gpu_rows(output: &str) -> Vec<GpuSnapshot> {
    csv_rows(output)
        .filter(|cols| cols.len() >= 6)
        .map(|cols| GpuSnapshot {
            index: cols[0].parse().unwrap_or(0),
            uuid: cols[1].to_string(),
            util_gpu_percent: cols[2].parse().ok(),
            util_mem_percent: cols[3].parse().unwrap_or(0),
            mem_used_bytes: cols[4].parse::<u64>().unwrap_or(0) * MIB,
            mem_total_bytes: cols[5].parse::<u64>().unwrap_or(0) * MIB,
            compute_procs: Vec::new(),
        })
        .collect()
}

/// Parse `--query-compute-apps` output
pub fn parse_process_rows(output: &str) -> Vec<ProcessRow> {
    csv_rows(output)
        .filter(|cols| cols.len() >= 3)
        .map(|cols| ProcessRow {
            gpu_uuid: cols[0].to_string(),
            pid: cols[1].parse().unwrap_or(0),
            used_bytes: cols[2].parse::<u64>().unwrap_or(0) * MIB,
        })
        .collect()
}

fn attach_processes(gpus: &mut [GpuSnapshot], processes: Vec<ProcessRow>) {
    let by_uuid: HashMap<String, usize> = gpus
        .iter()
        .enumerate()
        .filter(|(_, g)| !g.uuid.is_empty())
        .map(|(i, g)| (g.uuid.clone(), i))
        .collect();

    for row in processes {
        match by_uuid.get(&row.gpu_uuid) {
            Some(&i) => gpus[i].compute_procs.push(GpuProcess {
                pid: row.pid,
                used_bytes: row.used_bytes,
            }),
            None => debug!(gpu_uuid = %row.gpu_uuid, pid = row.pid, "Process on unknown GPU"),
        }
    }
}
