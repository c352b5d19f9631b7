//! Reclaim pipeline
//!
//! Turns per-tick GPU snapshots into validated, reported reclaim candidates.

mod aggregator;
mod r#loop;
mod validator;


pub use aggregator::{AttributionFailures, EvidenceAggregator, TickAggregation, WorkloadAggregate};
pub use r#loop::{
    ReclaimConfig, TickOrchestrator, TickOrchestratorBuilder, TickSummary,
    DEFAULT_PROCESS_ALLOWLIST,
};
pub use validator::{judge, CandidateValidator, Rejection, Verdict};
