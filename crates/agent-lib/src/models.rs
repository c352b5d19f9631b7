//! Core data models for the reclaimer agent

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;

/// Maximum number of command lines retained as evidence for one workload
pub const MAX_EVIDENCE_CMDLINES: usize = 5;

/// A sampling instant read from both clocks.
///
/// Elapsed time is measured on the monotonic clock so wall-clock steps
/// cannot stretch or shrink an idle episode. The wall time is only reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub wall: DateTime<Utc>,
    pub mono: Instant,
}

impl Timestamp {
    pub fn now() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    /// Move both clocks forward. Negative offsets leave the monotonic clock in place.
    pub fn advanced_by(self, by: Duration) -> Self {
        Self {
            wall: self.wall + by,
            mono: self.mono + by.to_std().unwrap_or_default(),
        }
    }

    /// Monotonic time elapsed since `earlier`, zero if `earlier` is later
    pub fn since(&self, earlier: &Timestamp) -> Duration {
        Duration::from_std(self.mono.saturating_duration_since(earlier.mono))
            .unwrap_or_else(|_| Duration::zero())
    }
}

/// A single compute process running on a GPU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuProcess {
    pub pid: u32,
    pub used_bytes: u64,
}

/// Point-in-time view of one GPU
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSnapshot {
    pub index: u32,
    pub uuid: String,
    /// `None` when the driver could not report utilization
    pub util_gpu_percent: Option<u32>,
    pub util_mem_percent: u32,
    pub mem_used_bytes: u64,
    pub mem_total_bytes: u64,
    pub compute_procs: Vec<GpuProcess>,
}

impl GpuSnapshot {
    /// A GPU is idle when its utilization is known and strictly below the
    /// threshold. Unknown utilization never counts as idle.
    pub fn is_idle(&self, threshold_pct: u32) -> bool {
        matches!(self.util_gpu_percent, Some(util) if util < threshold_pct)
    }
}

/// Snapshot of every GPU visible on the node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub gpus: Vec<GpuSnapshot>,
}

impl Snapshot {
    /// Check whether any GPU currently lists the given pid
    pub fn has_pid(&self, pid: u32) -> bool {
        self.gpus
            .iter()
            .any(|g| g.compute_procs.iter().any(|p| p.pid == pid))
    }
}

/// Identity of a reclaim subject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub container_id: String,
}

/// The value a workload is tracked under.
///
/// A non-empty pod UID wins, then a non-empty container id. Workloads with
/// neither share the single `Unknown` slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackingId {
    Uid(String),
    Container(String),
    Unknown,
}

impl WorkloadKey {
    pub fn tracking_id(&self) -> TrackingId {
        if !self.uid.is_empty() {
            TrackingId::Uid(self.uid.clone())
        } else if !self.container_id.is_empty() {
            TrackingId::Container(self.container_id.clone())
        } else {
            TrackingId::Unknown
        }
    }
}

impl std::fmt::Display for TrackingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackingId::Uid(uid) => write!(f, "uid:{}", uid),
            TrackingId::Container(cid) => write!(f, "cid:{}", cid),
            TrackingId::Unknown => f.write_str("unknown"),
        }
    }
}

/// Evidence gathered for one workload during idle observation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodEvidence {
    pub gpus: BTreeSet<u32>,
    pub pids: BTreeSet<u32>,
    pub cmdlines: Vec<String>,
    /// Consecutive idle samples at the time the snapshot was taken
    pub util_samples: u32,
    pub idle_since: Option<DateTime<Utc>>,
}

/// A workload whose idle episode crossed both the sample and duration thresholds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub key: WorkloadKey,
    pub evidence: PodEvidence,
    pub idle_for: Duration,
}

/// Reported shape of an accepted candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub node: String,
    pub pod_uid: String,
    pub pod_namespace: String,
    pub pod_name: String,
    pub container_id: String,
    pub idle_minutes: i64,
    pub util_samples: u32,
    pub gpu_indexes: Vec<u32>,
    pub pids: Vec<u32>,
    pub cmdlines: Vec<String>,
    /// Always true until an enforcer exists
    pub dry_run: bool,
    /// Value of the dry-run setting the agent was started with
    pub dry_run_config: bool,
}

impl ReclaimReport {
    pub fn from_candidate(node: &str, candidate: &Candidate, dry_run_config: bool) -> Self {
        Self {
            node: node.to_string(),
            pod_uid: candidate.key.uid.clone(),
            pod_namespace: candidate.key.namespace.clone(),
            pod_name: candidate.key.name.clone(),
            container_id: candidate.key.container_id.clone(),
            idle_minutes: candidate.idle_for.num_minutes(),
            util_samples: candidate.evidence.util_samples,
            gpu_indexes: candidate.evidence.gpus.iter().copied().collect(),
            pids: candidate.evidence.pids.iter().copied().collect(),
            cmdlines: candidate
                .evidence
                .cmdlines
                .iter()
                .take(MAX_EVIDENCE_CMDLINES)
                .cloned()
                .collect(),
            dry_run: true,
            dry_run_config,
        }
    }
}
