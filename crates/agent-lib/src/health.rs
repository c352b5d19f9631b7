//! Pipeline health for the liveness and readiness endpoints
//!
//! The reclaim loop records what each tick did. Component status is derived
//! from those records when an endpoint is queried, so a loop that stops
//! ticking turns unhealthy without anything having to mark it.

use crate::sampler::SamplerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Consecutive failed samples after which the sampler counts as failed
pub const SAMPLER_FAILURE_THRESHOLD: u32 = 3;

/// Missed intervals after which the loop counts as stalled
const STALE_INTERVALS: u32 = 5;
const MIN_STALE_AFTER: Duration = Duration::from_secs(120);

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still producing results, but something is failing
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    /// Returns true if the component is at least partially operational
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

/// Information about a component's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix seconds of the last record for this component, absent before the first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check_timestamp: Option<i64>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>, checked: Option<i64>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: checked,
        }
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across all components
    pub fn compute_status(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        let mut has_degraded = false;

        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }

        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names used as keys in the health response
pub mod components {
    pub const SAMPLER: &str = "sampler";
    pub const ATTRIBUTION: &str = "attribution";
    pub const TRACKER: &str = "tracker";
}

#[derive(Debug)]
struct PipelineState {
    started: Instant,
    ready: bool,
    sampler_failures: u32,
    sampler_error: Option<String>,
    sampler_checked: Option<i64>,
    /// Processes attributed and failed during the last tick
    attribution: Option<(usize, usize)>,
    attribution_checked: Option<i64>,
    last_tick: Option<Instant>,
    last_tick_checked: Option<i64>,
    tracked: usize,
}

impl PipelineState {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            ready: false,
            sampler_failures: 0,
            sampler_error: None,
            sampler_checked: None,
            attribution: None,
            attribution_checked: None,
            last_tick: None,
            last_tick_checked: None,
            tracked: 0,
        }
    }

    fn sampler(&self) -> ComponentHealth {
        let checked = self.sampler_checked;
        let error = self.sampler_error.as_deref().unwrap_or("unknown error");
        match self.sampler_failures {
            0 => ComponentHealth::new(ComponentStatus::Healthy, None, checked),
            n if n < SAMPLER_FAILURE_THRESHOLD => ComponentHealth::new(
                ComponentStatus::Degraded,
                Some(format!("{n} consecutive sample failures: {error}")),
                checked,
            ),
            n => ComponentHealth::new(
                ComponentStatus::Unhealthy,
                Some(format!("{n} consecutive sample failures: {error}")),
                checked,
            ),
        }
    }

    fn attribution(&self) -> ComponentHealth {
        let checked = self.attribution_checked;
        match self.attribution {
            Some((0, failed)) if failed > 0 => ComponentHealth::new(
                ComponentStatus::Degraded,
                Some(format!("all {failed} GPU processes failed attribution")),
                checked,
            ),
            _ => ComponentHealth::new(ComponentStatus::Healthy, None, checked),
        }
    }

    fn tracker(&self, now: Instant, stale_after: Duration) -> ComponentHealth {
        let checked = self.last_tick_checked;
        let since = now.saturating_duration_since(self.last_tick.unwrap_or(self.started));
        if since > stale_after {
            let message = match self.last_tick {
                Some(_) => format!("no tick completed in {}s", since.as_secs()),
                None => format!("no tick completed since start {}s ago", since.as_secs()),
            };
            ComponentHealth::new(ComponentStatus::Unhealthy, Some(message), checked)
        } else {
            let message = self
                .last_tick
                .map(|_| format!("{} workloads tracked", self.tracked));
            ComponentHealth::new(ComponentStatus::Healthy, message, checked)
        }
    }
}

/// Shared view of reclaim loop health.
///
/// Cloning is cheap; the loop writes through one clone and the HTTP API
/// reads through another.
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<PipelineState>>,
    stale_after: Duration,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    /// Registry for the default 60 second sample interval
    pub fn new() -> Self {
        Self::for_interval(Duration::from_secs(60))
    }

    /// Registry that considers the loop stalled after five missed intervals,
    /// and never sooner than two minutes
    pub fn for_interval(sample_interval: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(PipelineState::new())),
            stale_after: (sample_interval * STALE_INTERVALS).max(MIN_STALE_AFTER),
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub async fn record_sample_ok(&self) {
        let mut state = self.state.write().await;
        state.sampler_failures = 0;
        state.sampler_error = None;
        state.sampler_checked = Some(chrono::Utc::now().timestamp());
    }

    pub async fn record_sample_failure(&self, error: &SamplerError) {
        let mut state = self.state.write().await;
        state.sampler_failures = state.sampler_failures.saturating_add(1);
        state.sampler_error = Some(error.to_string());
        state.sampler_checked = Some(chrono::Utc::now().timestamp());
    }

    /// Record how many GPU processes were attributed and how many failed
    pub async fn record_attribution(&self, attributed: usize, failed: usize) {
        let mut state = self.state.write().await;
        state.attribution = Some((attributed, failed));
        state.attribution_checked = Some(chrono::Utc::now().timestamp());
    }

    /// Record a completed tick
    pub async fn record_tick(&self, tracked: usize) {
        let mut state = self.state.write().await;
        state.last_tick = Some(Instant::now());
        state.last_tick_checked = Some(chrono::Utc::now().timestamp());
        state.tracked = tracked;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        self.health_at(Instant::now()).await
    }

    /// Health as seen at `now`
    pub async fn health_at(&self, now: Instant) -> HealthResponse {
        let state = self.state.read().await;
        let components = BTreeMap::from([
            (components::SAMPLER.to_string(), state.sampler()),
            (components::ATTRIBUTION.to_string(), state.attribution()),
            (
                components::TRACKER.to_string(),
                state.tracker(now, self.stale_after),
            ),
        ]);
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        self.readiness_at(Instant::now()).await
    }

    /// Ready once initialized, and for as long as no component is unhealthy
    pub async fn readiness_at(&self, now: Instant) -> ReadinessResponse {
        if !self.state.read().await.ready {
            return ReadinessResponse {
                ready: false,
                reason: Some("Agent not yet initialized".to_string()),
            };
        }

        let health = self.health_at(now).await;
        let failed: Vec<&str> = health
            .components
            .iter()
            .filter(|(_, c)| !c.status.is_operational())
            .map(|(name, _)| name.as_str())
            .collect();

        if failed.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy: {}", failed.join(", "))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_lost() -> SamplerError {
        SamplerError::Nvml("device lost".to_string())
    }

    fn status(health: &HealthResponse, component: &str) -> ComponentStatus {
        health.components[component].status
    }

    #[tokio::test]
    async fn test_initial_state_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert_eq!(health.components.len(), 3);
        assert!(health.components[components::SAMPLER]
            .last_check_timestamp
            .is_none());
    }

    #[tokio::test]
    async fn test_sampler_degrades_then_fails() {
        let registry = HealthRegistry::new();

        registry.record_sample_failure(&device_lost()).await;
        let health = registry.health().await;
        assert_eq!(status(&health, components::SAMPLER), ComponentStatus::Degraded);
        assert_eq!(health.status, ComponentStatus::Degraded);

        for _ in 1..SAMPLER_FAILURE_THRESHOLD {
            registry.record_sample_failure(&device_lost()).await;
        }
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        let message = health.components[components::SAMPLER].message.clone().unwrap();
        assert!(message.starts_with("3 consecutive sample failures"));
        assert!(message.contains("device lost"));
    }

    #[tokio::test]
    async fn test_persistent_sampler_failure_is_not_ready() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;

        for _ in 0..500 {
            registry.record_sample_failure(&device_lost()).await;
        }

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Unhealthy: sampler"));
    }

    #[tokio::test]
    async fn test_successful_sample_clears_failures() {
        let registry = HealthRegistry::new();
        for _ in 0..SAMPLER_FAILURE_THRESHOLD {
            registry.record_sample_failure(&device_lost()).await;
        }

        registry.record_sample_ok().await;

        let health = registry.health().await;
        assert_eq!(status(&health, components::SAMPLER), ComponentStatus::Healthy);
        assert!(health.components[components::SAMPLER].message.is_none());
    }

    #[tokio::test]
    async fn test_attribution_degraded_only_when_everything_failed() {
        let registry = HealthRegistry::new();

        registry.record_attribution(1, 4).await;
        let health = registry.health().await;
        assert_eq!(status(&health, components::ATTRIBUTION), ComponentStatus::Healthy);

        registry.record_attribution(0, 4).await;
        let health = registry.health().await;
        assert_eq!(status(&health, components::ATTRIBUTION), ComponentStatus::Degraded);

        // No GPU processes at all is not a failure
        registry.record_attribution(0, 0).await;
        let health = registry.health().await;
        assert_eq!(status(&health, components::ATTRIBUTION), ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_stalled_loop_makes_tracker_unhealthy() {
        let registry = HealthRegistry::for_interval(Duration::from_secs(60));
        registry.set_ready(true).await;
        registry.record_tick(4).await;

        let now = Instant::now();
        let health = registry.health_at(now).await;
        assert_eq!(status(&health, components::TRACKER), ComponentStatus::Healthy);
        assert_eq!(
            health.components[components::TRACKER].message.as_deref(),
            Some("4 workloads tracked")
        );

        let later = now + registry.stale_after() + Duration::from_secs(1);
        let health = registry.health_at(later).await;
        assert_eq!(status(&health, components::TRACKER), ComponentStatus::Unhealthy);
        assert!(!registry.readiness_at(later).await.ready);
    }

    #[tokio::test]
    async fn test_loop_that_never_ticks_turns_unhealthy() {
        let registry = HealthRegistry::new();
        let later = Instant::now() + registry.stale_after() + Duration::from_secs(1);

        let health = registry.health_at(later).await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert!(health.components[components::TRACKER]
            .message
            .as_deref()
            .unwrap()
            .starts_with("no tick completed since start"));
    }

    #[test]
    fn test_stale_window_scales_with_interval() {
        assert_eq!(
            HealthRegistry::for_interval(Duration::from_secs(10)).stale_after(),
            Duration::from_secs(120)
        );
        assert_eq!(
            HealthRegistry::for_interval(Duration::from_secs(60)).stale_after(),
            Duration::from_secs(300)
        );
    }

    #[tokio::test]
    async fn test_readiness_not_ready_initially() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;

        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Agent not yet initialized"));
    }

    #[tokio::test]
    async fn test_readiness_survives_degraded_components() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;
        registry.record_sample_failure(&device_lost()).await;
        registry.record_attribution(0, 2).await;

        let readiness = registry.readiness().await;
        assert!(readiness.ready);
        assert!(readiness.reason.is_none());
    }
}
