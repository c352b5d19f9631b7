//! Sampling loop
//!
//! Drives the reclaim pipeline on a fixed interval: sample, aggregate,
//! observe, validate, report, then garbage-collect stale tracking state.

use super::aggregator::{AttributionFailures, EvidenceAggregator};
use super::validator::{CandidateValidator, Rejection, Verdict};
use crate::attribution::PidResolver;
use crate::health::HealthRegistry;
use crate::idle::IdleTracker;
use crate::models::{ReclaimReport, Timestamp};
use crate::observability::{ReclaimMetrics, StructuredLogger};
use crate::sampler::{Sampler, SamplerError};
use anyhow::Result;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Allow-list for driver daemons that hold a GPU context without doing work
pub const DEFAULT_PROCESS_ALLOWLIST: &str = r"(^|/)(nvidia-persistenced|nvidia-powerd)$";

/// Configuration for the reclaim loop
#[derive(Debug, Clone)]
pub struct ReclaimConfig {
    /// Minimum idle episode length before a candidate is emitted (default: 30)
    pub idle_minutes: u32,
    /// Time between ticks (default: 60 seconds)
    pub sample_interval: Duration,
    /// Idle samples required before a candidate is emitted (default: 30)
    pub consecutive_idle_samples: u32,
    /// A GPU is idle when its utilization is strictly below this (default: 1)
    pub gpu_util_threshold_pct: u32,
    /// Processes whose command line matches are never attributed
    pub process_allowlist: Regex,
    pub dry_run: bool,
    /// Upper bound for resolving a single pid (default: 2 seconds)
    pub attribution_timeout: Duration,
    /// Tracking state unseen for longer than this is dropped (default: 2 hours)
    pub state_retention: chrono::Duration,
    pub node_name: String,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            idle_minutes: 30,
            sample_interval: Duration::from_secs(60),
            consecutive_idle_samples: 30,
            gpu_util_threshold_pct: 1,
            process_allowlist: Regex::new(DEFAULT_PROCESS_ALLOWLIST)
                .expect("default allow-list is a valid regex"),
            dry_run: false,
            attribution_timeout: Duration::from_secs(2),
            state_retention: chrono::Duration::hours(2),
            node_name: "unknown".to_string(),
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Default)]
pub struct TickSummary {
    pub gpus: usize,
    pub workloads_observed: usize,
    pub failures: AttributionFailures,
    pub candidates_emitted: usize,
    /// Candidates that passed validation and were reported
    pub reports: Vec<ReclaimReport>,
    /// Tracking entries dropped by garbage collection
    pub expired: usize,
}

/// The single control loop of the agent
pub struct TickOrchestrator {
    sampler: Arc<dyn Sampler>,
    aggregator: EvidenceAggregator,
    tracker: IdleTracker,
    validator: CandidateValidator,
    config: ReclaimConfig,
    logger: StructuredLogger,
    metrics: ReclaimMetrics,
    health: Option<HealthRegistry>,
}

impl TickOrchestrator {
    /// Create a new orchestrator. The same sampler is used for the tick
    /// snapshot and for candidate validation.
    pub fn new(
        sampler: Arc<dyn Sampler>,
        resolver: Arc<dyn PidResolver>,
        config: ReclaimConfig,
    ) -> Self {
        let aggregator = EvidenceAggregator::new(
            resolver,
            config.gpu_util_threshold_pct,
            config.process_allowlist.clone(),
            config.attribution_timeout,
        );
        let tracker = IdleTracker::new(config.idle_minutes, config.consecutive_idle_samples);
        let validator = CandidateValidator::new(sampler.clone(), config.gpu_util_threshold_pct);
        let logger = StructuredLogger::new(config.node_name.clone());

        Self {
            sampler,
            aggregator,
            tracker,
            validator,
            config,
            logger,
            metrics: ReclaimMetrics::new(),
            health: None,
        }
    }

    /// Report component health to the given registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn tracker(&self) -> &IdleTracker {
        &self.tracker
    }

    /// Run until a shutdown signal arrives. The first tick fires immediately.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        self.logger.log_sampler_selected(self.sampler.name());
        info!(
            interval_secs = self.config.sample_interval.as_secs(),
            idle_minutes = self.config.idle_minutes,
            consecutive_idle_samples = self.config.consecutive_idle_samples,
            "Starting reclaim loop"
        );

        let mut ticker = interval(self.config.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(summary) => debug!(
                            gpus = summary.gpus,
                            workloads = summary.workloads_observed,
                            attribution_failures = summary.failures.total(),
                            candidates = summary.candidates_emitted,
                            reported = summary.reports.len(),
                            tracked = self.tracker.len(),
                            "Tick complete"
                        ),
                        Err(e) => warn!(error = %e, "Tick failed, retrying next interval"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down reclaim loop");
                    break;
                }
            }
        }

        if let Err(e) = self.sampler.close() {
            warn!(error = %e, "Failed to close GPU sampler");
        }
    }

    /// Run one tick at the current time
    pub async fn tick(&mut self) -> Result<TickSummary, SamplerError> {
        self.tick_at(Timestamp::now()).await
    }

    /// Run one tick, stamping observations and GC with `now`
    pub async fn tick_at(&mut self, now: Timestamp) -> Result<TickSummary, SamplerError> {
        let started = Instant::now();

        let snapshot = match self.sampler.sample().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.metrics.inc_tick_failures();
                if let Some(health) = &self.health {
                    health.record_sample_failure(&e).await;
                }
                return Err(e);
            }
        };
        if let Some(health) = &self.health {
            health.record_sample_ok().await;
        }

        let aggregation = self.aggregator.aggregate(&snapshot).await;
        self.metrics.add_attribution_failures(&aggregation.failures);
        self.logger.log_attribution_failures(&aggregation.failures);
        if let Some(health) = &self.health {
            health
                .record_attribution(aggregation.attributed, aggregation.failures.total())
                .await;
        }

        let mut summary = TickSummary {
            gpus: snapshot.gpus.len(),
            workloads_observed: aggregation.workloads.len(),
            failures: aggregation.failures,
            ..Default::default()
        };

        let candidates: Vec<_> = aggregation
            .workloads
            .into_iter()
            .filter_map(|workload| self.tracker.observe(workload.into_observation(now)))
            .collect();
        summary.candidates_emitted = candidates.len();

        for candidate in &candidates {
            self.metrics.inc_candidates_emitted();

            match self.validator.validate(candidate).await {
                Verdict::Accepted => {
                    let report = ReclaimReport::from_candidate(
                        &self.config.node_name,
                        candidate,
                        self.config.dry_run,
                    );
                    self.logger.log_reclaim_candidate(&report);
                    self.metrics.inc_candidates_accepted();
                    summary.reports.push(report);
                }
                Verdict::Rejected(Rejection::ResampleFailed(e)) => {
                    self.logger
                        .log_validation_error(&candidate.key, &e.to_string());
                    self.metrics.inc_candidates_rejected("resample_failed");
                }
                Verdict::Rejected(rejection) => {
                    self.logger
                        .log_candidate_rejected(&candidate.key, &rejection.reason_code());
                    self.metrics.inc_candidates_rejected(rejection.category());
                }
            }
        }

        summary.expired = self.tracker.gc(now, self.config.state_retention);
        self.metrics.set_workloads_tracked(self.tracker.len());
        if let Some(health) = &self.health {
            health.record_tick(self.tracker.len()).await;
        }

        self.metrics.inc_ticks();
        self.metrics
            .observe_tick_latency(started.elapsed().as_secs_f64());

        Ok(summary)
    }
}

/// Builder for creating the reclaim loop
pub struct TickOrchestratorBuilder {
    sampler: Option<Arc<dyn Sampler>>,
    resolver: Option<Arc<dyn PidResolver>>,
    health: Option<HealthRegistry>,
    config: ReclaimConfig,
}

impl TickOrchestratorBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            sampler: None,
            resolver: None,
            health: None,
            config: ReclaimConfig::default(),
        }
    }

    pub fn sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn PidResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ReclaimConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.config.sample_interval = interval;
        self
    }

    pub fn node_name(mut self, node_name: impl Into<String>) -> Self {
        self.config.node_name = node_name.into();
        self
    }

    /// Build the orchestrator
    pub fn build(self) -> Result<TickOrchestrator> {
        let sampler = self
            .sampler
            .ok_or_else(|| anyhow::anyhow!("Sampler is required"))?;
        let resolver = self
            .resolver
            .ok_or_else(|| anyhow::anyhow!("Resolver is required"))?;
        if self.config.sample_interval.is_zero() {
            anyhow::bail!("Sample interval must be greater than zero");
        }

        let orchestrator = TickOrchestrator::new(sampler, resolver, self.config);
        Ok(match self.health {
            Some(health) => orchestrator.with_health(health),
            None => orchestrator,
        })
    }
}

impl Default for TickOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reclaim_config_default() {
        let config = ReclaimConfig::default();
        assert_eq!(config.idle_minutes, 30);
        assert_eq!(config.sample_interval, Duration::from_secs(60));
        assert_eq!(config.consecutive_idle_samples, 30);
        assert_eq!(config.gpu_util_threshold_pct, 1);
        assert_eq!(config.state_retention, chrono::Duration::hours(2));
        assert!(!config.dry_run);
    }

    #[test]
    fn test_default_allowlist_matches_driver_daemons() {
        let config = ReclaimConfig::default();
        assert!(config.process_allowlist.is_match("/usr/bin/nvidia-persistenced"));
        assert!(config.process_allowlist.is_match("nvidia-powerd"));
        assert!(!config.process_allowlist.is_match("python train.py"));
        assert!(!config
            .process_allowlist
            .is_match("/usr/bin/nvidia-persistenced --verbose"));
    }

    #[test]
    fn test_builder_missing_sampler() {
        let result = TickOrchestratorBuilder::new().build();
        assert!(result.is_err());
    }
}
