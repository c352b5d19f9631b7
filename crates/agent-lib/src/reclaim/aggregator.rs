//! Per-tick evidence aggregation
//!
//! Folds every (GPU, compute process) pair of a snapshot into one record per
//! workload. A workload is idle for the tick only if every GPU it touched
//! during the tick is idle.

use crate::attribution::{AttributionError, PidResolver};
use crate::idle::Observation;
use crate::models::{Snapshot, Timestamp, TrackingId, WorkloadKey, MAX_EVIDENCE_CMDLINES};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Attribution failures seen during one tick, by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributionFailures {
    pub process_gone: usize,
    pub no_identifiers: usize,
    pub timed_out: usize,
}

impl AttributionFailures {
    fn record(&mut self, error: &AttributionError) {
        match error {
            AttributionError::ProcessGone { .. } => self.process_gone += 1,
            AttributionError::NoIdentifiers { .. } => self.no_identifiers += 1,
            AttributionError::TimedOut { .. } => self.timed_out += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.process_gone + self.no_identifiers + self.timed_out
    }

    /// Counts paired with their metric label
    pub fn by_kind(&self) -> [(&'static str, usize); 3] {
        [
            ("process_gone", self.process_gone),
            ("no_identifiers", self.no_identifiers),
            ("timed_out", self.timed_out),
        ]
    }
}

/// Evidence for one workload within a single tick
#[derive(Debug, Clone)]
pub struct WorkloadAggregate {
    pub key: WorkloadKey,
    pub gpus: BTreeSet<u32>,
    pub pids: BTreeSet<u32>,
    pub cmdlines: Vec<String>,
    gpu_idle: BTreeMap<u32, bool>,
}

impl WorkloadAggregate {
    fn new(key: WorkloadKey) -> Self {
        Self {
            key,
            gpus: BTreeSet::new(),
            pids: BTreeSet::new(),
            cmdlines: Vec::new(),
            gpu_idle: BTreeMap::new(),
        }
    }

    /// Idle only if every GPU touched this tick is idle
    pub fn is_idle(&self) -> bool {
        !self.gpus.is_empty()
            && self
                .gpus
                .iter()
                .all(|gpu| self.gpu_idle.get(gpu).copied().unwrap_or(false))
    }

    pub fn into_observation(self, seen_at: Timestamp) -> Observation {
        let idle = self.is_idle();
        Observation {
            key: self.key,
            seen_at,
            idle,
            gpus: self.gpus,
            pids: self.pids,
            cmdlines: self.cmdlines,
        }
    }
}

/// Result of aggregating one snapshot
#[derive(Debug, Default)]
pub struct TickAggregation {
    pub workloads: Vec<WorkloadAggregate>,
    pub failures: AttributionFailures,
    /// Processes resolved successfully, including allow-listed ones
    pub attributed: usize,
    /// Processes skipped because their command line is allow-listed
    pub allowlisted: usize,
}

/// Groups GPU processes into per-workload evidence
pub struct EvidenceAggregator {
    resolver: Arc<dyn PidResolver>,
    util_threshold_pct: u32,
    allowlist: Regex,
    attribution_timeout: Duration,
}

impl EvidenceAggregator {
    pub fn new(
        resolver: Arc<dyn PidResolver>,
        util_threshold_pct: u32,
        allowlist: Regex,
        attribution_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            util_threshold_pct,
            allowlist,
            attribution_timeout,
        }
    }

    /// Attribute every compute process in the snapshot and group by workload.
    ///
    /// Attribution runs sequentially, each call bounded by the attribution
    /// timeout. Failed processes are counted and left out entirely.
    pub async fn aggregate(&self, snapshot: &Snapshot) -> TickAggregation {
        let mut by_workload: BTreeMap<TrackingId, WorkloadAggregate> = BTreeMap::new();
        let mut result = TickAggregation::default();

        for gpu in &snapshot.gpus {
            let gpu_idle = gpu.is_idle(self.util_threshold_pct);

            for process in &gpu.compute_procs {
                let pid = process.pid;
                let attribution = match tokio::time::timeout(
                    self.attribution_timeout,
                    self.resolver.resolve(pid),
                )
                .await
                {
                    Ok(Ok(attribution)) => attribution,
                    Ok(Err(e)) => {
                        Self::record_failure(&mut result.failures, gpu.index, e);
                        continue;
                    }
                    Err(_) => {
                        let e = AttributionError::TimedOut {
                            pid,
                            timeout: self.attribution_timeout,
                        };
                        Self::record_failure(&mut result.failures, gpu.index, e);
                        continue;
                    }
                };
                result.attributed += 1;

                if !attribution.cmdline.is_empty() && self.allowlist.is_match(&attribution.cmdline)
                {
                    debug!(pid, cmdline = %attribution.cmdline, "Skipping allow-listed process");
                    result.allowlisted += 1;
                    continue;
                }

                let key = attribution.key();
                let tracking_id = key.tracking_id();
                debug!(
                    pid,
                    gpu = gpu.index,
                    workload = %tracking_id,
                    provenance = attribution.provenance.as_str(),
                    "Attributed GPU process"
                );
                let workload = by_workload
                    .entry(tracking_id)
                    .or_insert_with(|| WorkloadAggregate::new(key));

                workload.gpus.insert(gpu.index);
                workload.pids.insert(pid);
                if !attribution.cmdline.is_empty() && workload.cmdlines.len() < MAX_EVIDENCE_CMDLINES
                {
                    workload.cmdlines.push(attribution.cmdline);
                }
                workload.gpu_idle.insert(gpu.index, gpu_idle);
            }
        }

        result.workloads = by_workload.into_values().collect();
        result
    }

    fn record_failure(failures: &mut AttributionFailures, gpu: u32, error: AttributionError) {
        warn!(
            gpu,
            pid = error_pid(&error),
            kind = error.kind(),
            error = %error,
            "PID attribution failed"
        );
        failures.record(&error);
    }
}

fn error_pid(error: &AttributionError) -> u32 {
    match error {
        AttributionError::ProcessGone { pid, .. }
        | AttributionError::NoIdentifiers { pid }
        | AttributionError::TimedOut { pid, .. } => *pid,
    }
}
