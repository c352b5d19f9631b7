//! Observability infrastructure for the reclaimer agent
//!
//! Provides:
//! - Prometheus metrics (tick latency, attribution failures, candidate outcomes)
//! - Structured JSON logging with tracing

use crate::models::{ReclaimReport, WorkloadKey};
use crate::reclaim::AttributionFailures;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for tick latency (in seconds)
const TICK_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ReclaimMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct ReclaimMetricsInner {
    tick_latency_seconds: Histogram,
    ticks: IntCounter,
    tick_failures: IntCounter,
    attribution_failures: IntCounterVec,
    enrichment_failures: IntCounter,
    enrichment_cache_hits: IntCounter,
    enrichment_cache_misses: IntCounter,
    workloads_tracked: IntGauge,
    candidates_emitted: IntCounter,
    candidates_accepted: IntCounter,
    candidates_rejected: IntCounterVec,
}

impl ReclaimMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "gpu_reclaimer_tick_latency_seconds",
                "Time spent on one sampling tick",
                TICK_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            ticks: register_int_counter!(
                "gpu_reclaimer_ticks_total",
                "Total number of completed sampling ticks"
            )
            .expect("Failed to register ticks"),

            tick_failures: register_int_counter!(
                "gpu_reclaimer_tick_failures_total",
                "Total number of ticks aborted because the GPU snapshot failed"
            )
            .expect("Failed to register tick_failures"),

            attribution_failures: register_int_counter_vec!(
                "gpu_reclaimer_attribution_failures_total",
                "GPU processes that could not be attributed to a workload",
                &["kind"]
            )
            .expect("Failed to register attribution_failures"),

            enrichment_failures: register_int_counter!(
                "gpu_reclaimer_enrichment_failures_total",
                "Container runtime metadata lookups that failed"
            )
            .expect("Failed to register enrichment_failures"),

            enrichment_cache_hits: register_int_counter!(
                "gpu_reclaimer_enrichment_cache_hits_total",
                "Container metadata served from cache"
            )
            .expect("Failed to register enrichment_cache_hits"),

            enrichment_cache_misses: register_int_counter!(
                "gpu_reclaimer_enrichment_cache_misses_total",
                "Container metadata cache misses"
            )
            .expect("Failed to register enrichment_cache_misses"),

            workloads_tracked: register_int_gauge!(
                "gpu_reclaimer_workloads_tracked",
                "Number of workloads with idle tracking state"
            )
            .expect("Failed to register workloads_tracked"),

            candidates_emitted: register_int_counter!(
                "gpu_reclaimer_candidates_emitted_total",
                "Idle episodes that crossed the reclaim thresholds"
            )
            .expect("Failed to register candidates_emitted"),

            candidates_accepted: register_int_counter!(
                "gpu_reclaimer_candidates_accepted_total",
                "Candidates that passed validation"
            )
            .expect("Failed to register candidates_accepted"),

            candidates_rejected: register_int_counter_vec!(
                "gpu_reclaimer_candidates_rejected_total",
                "Candidates dropped by validation",
                &["reason"]
            )
            .expect("Failed to register candidates_rejected"),
        }
    }
}

/// Reclaimer metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ReclaimMetrics {
    _private: (),
}

impl Default for ReclaimMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReclaimMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ReclaimMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ReclaimMetricsInner {
        GLOBAL_METRICS.get_or_init(ReclaimMetricsInner::new)
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    pub fn inc_ticks(&self) {
        self.inner().ticks.inc();
    }

    pub fn inc_tick_failures(&self) {
        self.inner().tick_failures.inc();
    }

    /// Add one tick's attribution failures, by kind
    pub fn add_attribution_failures(&self, failures: &AttributionFailures) {
        for (kind, count) in failures.by_kind() {
            if count > 0 {
                self.inner()
                    .attribution_failures
                    .with_label_values(&[kind])
                    .inc_by(count as u64);
            }
        }
    }

    pub fn inc_enrichment_failures(&self) {
        self.inner().enrichment_failures.inc();
    }

    pub fn inc_enrichment_cache_hits(&self) {
        self.inner().enrichment_cache_hits.inc();
    }

    pub fn inc_enrichment_cache_misses(&self) {
        self.inner().enrichment_cache_misses.inc();
    }

    pub fn set_workloads_tracked(&self, count: usize) {
        self.inner().workloads_tracked.set(count as i64);
    }

    pub fn inc_candidates_emitted(&self) {
        self.inner().candidates_emitted.inc();
    }

    pub fn inc_candidates_accepted(&self) {
        self.inner().candidates_accepted.inc();
    }

    pub fn inc_candidates_rejected(&self, reason: &str) {
        self.inner()
            .candidates_rejected
            .with_label_values(&[reason])
            .inc();
    }

    /// Every registered metric in the Prometheus text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&prometheus::gather())
    }
}

/// Structured logger for agent events
///
/// The `reclaim_candidate` event is a stable output contract for log
/// processors; its field names must not change.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, dry_run: bool, interval_secs: u64) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            dry_run = dry_run,
            interval_secs = interval_secs,
            "GPU reclaimer agent started"
        );
    }

    pub fn log_sampler_selected(&self, sampler: &str) {
        info!(
            event = "sampler_selected",
            node = %self.node_name,
            sampler = %sampler,
            "GPU sampler selected"
        );
    }

    /// Log an accepted candidate
    pub fn log_reclaim_candidate(&self, report: &ReclaimReport) {
        info!(
            event = "reclaim_candidate",
            node = %report.node,
            pod_uid = %report.pod_uid,
            pod_namespace = %report.pod_namespace,
            pod_name = %report.pod_name,
            container_id = %report.container_id,
            idle_minutes = report.idle_minutes,
            util_samples = report.util_samples,
            gpu_indexes = ?report.gpu_indexes,
            pids = ?report.pids,
            cmdlines = ?report.cmdlines,
            dry_run = report.dry_run,
            dry_run_config = report.dry_run_config,
            "Reclaim candidate (dry-run)"
        );
    }

    /// Log a candidate that no longer holds
    pub fn log_candidate_rejected(&self, key: &WorkloadKey, reason: &str) {
        info!(
            event = "candidate_rejected",
            node = %self.node_name,
            pod_uid = %key.uid,
            container_id = %key.container_id,
            reason = %reason,
            "Candidate no longer valid"
        );
    }

    /// Log a candidate dropped because re-sampling failed
    pub fn log_validation_error(&self, key: &WorkloadKey, error: &str) {
        warn!(
            event = "candidate_validation_error",
            node = %self.node_name,
            pod_uid = %key.uid,
            container_id = %key.container_id,
            reason = "resample_failed",
            error = %error,
            "Candidate validation failed"
        );
    }

    /// Log the per-tick attribution failure summary
    pub fn log_attribution_failures(&self, failures: &AttributionFailures) {
        if failures.total() == 0 {
            return;
        }
        info!(
            event = "attribution_failures",
            node = %self.node_name,
            count = failures.total(),
            process_gone = failures.process_gone,
            no_identifiers = failures.no_identifiers,
            timed_out = failures.timed_out,
            "PID attribution failures in tick"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "GPU reclaimer agent shutting down"
        );
    }
}
