//! Candidate validation
//!
//! Evidence behind a candidate can be several ticks old. Before a candidate
//! is reported the GPUs are sampled again: the candidate only stands if its
//! GPUs are still idle and at least one of its processes is still running.

use crate::models::{Candidate, Snapshot};
use crate::sampler::{Sampler, SamplerError};
use std::sync::Arc;

/// Why a candidate was dropped
#[derive(Debug)]
pub enum Rejection {
    /// A GPU named in the evidence is busy again, or its utilization is unknown
    GpuNotIdle { index: u32, util_percent: Option<u32> },
    /// None of the evidence pids is running on any GPU
    PidsGone,
    /// The fresh snapshot could not be taken
    ResampleFailed(SamplerError),
}

impl Rejection {
    /// Reason code reported in logs, e.g. `gpu_0_util_not_idle`
    pub fn reason_code(&self) -> String {
        match self {
            Rejection::GpuNotIdle { index, .. } => format!("gpu_{}_util_not_idle", index),
            Rejection::PidsGone => "pids_gone".to_string(),
            Rejection::ResampleFailed(_) => "resample_failed".to_string(),
        }
    }

    /// Bounded label for metrics
    pub fn category(&self) -> &'static str {
        match self {
            Rejection::GpuNotIdle { .. } => "gpu_util_not_idle",
            Rejection::PidsGone => "pids_gone",
            Rejection::ResampleFailed(_) => "resample_failed",
        }
    }
}

/// Outcome of validating a candidate
#[derive(Debug)]
pub enum Verdict {
    Accepted,
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }

    pub fn reason_code(&self) -> String {
        match self {
            Verdict::Accepted => "ok".to_string(),
            Verdict::Rejected(rejection) => rejection.reason_code(),
        }
    }
}

/// Judge a candidate against a fresh snapshot.
///
/// GPUs in the evidence that are missing from the snapshot are ignored. The
/// pid check spans every GPU in the snapshot, not just the named ones.
pub fn judge(candidate: &Candidate, snapshot: &Snapshot, util_threshold_pct: u32) -> Verdict {
    let named_gpus = &candidate.evidence.gpus;

    if let Some(busy) = snapshot
        .gpus
        .iter()
        .filter(|g| named_gpus.contains(&g.index))
        .find(|g| !g.is_idle(util_threshold_pct))
    {
        return Verdict::Rejected(Rejection::GpuNotIdle {
            index: busy.index,
            util_percent: busy.util_gpu_percent,
        });
    }

    if !candidate
        .evidence
        .pids
        .iter()
        .any(|pid| snapshot.has_pid(*pid))
    {
        return Verdict::Rejected(Rejection::PidsGone);
    }

    Verdict::Accepted
}

/// Re-samples the GPUs to confirm a candidate is still valid
pub struct CandidateValidator {
    sampler: Arc<dyn Sampler>,
    util_threshold_pct: u32,
}

impl CandidateValidator {
    pub fn new(sampler: Arc<dyn Sampler>, util_threshold_pct: u32) -> Self {
        Self {
            sampler,
            util_threshold_pct,
        }
    }

    pub async fn validate(&self, candidate: &Candidate) -> Verdict {
        match self.sampler.sample().await {
            Ok(snapshot) => judge(candidate, &snapshot, self.util_threshold_pct),
            Err(e) => Verdict::Rejected(Rejection::ResampleFailed(e)),
        }
    }
}
