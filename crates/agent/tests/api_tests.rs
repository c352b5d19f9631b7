//! Integration tests for the agent API endpoints

use agent_lib::{
    health::{HealthRegistry, SAMPLER_FAILURE_THRESHOLD},
    observability::ReclaimMetrics,
    reclaim::AttributionFailures,
    sampler::SamplerError,
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use gpu_reclaimer_agent::api::{create_router, AppState};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    let metrics = ReclaimMetrics::new();
    let state = Arc::new(AppState::new(health_registry, metrics));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .record_sample_failure(&SamplerError::Timeout {
            binary: "nvidia-smi".to_string(),
            timeout: Duration::from_secs(5),
        })
        .await;

    // Degraded still returns 200 (operational)
    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
    let message = health["components"]["sampler"]["message"].as_str().unwrap();
    assert!(message.starts_with("1 consecutive sample failures"));
}

#[tokio::test]
async fn test_healthz_returns_503_when_sampler_keeps_failing() {
    let (app, state) = setup_test_app().await;

    for _ in 0..SAMPLER_FAILURE_THRESHOLD {
        state
            .health_registry
            .record_sample_failure(&SamplerError::Nvml("init failed".to_string()))
            .await;
    }

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(health["components"]["sampler"]["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_when_not_ready() {
    let (app, _state) = setup_test_app().await;

    // By default, agent is not ready
    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;
    for _ in 0..SAMPLER_FAILURE_THRESHOLD {
        state
            .health_registry
            .record_sample_failure(&SamplerError::Nvml("device lost".to_string()))
            .await;
    }

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["reason"], "Unhealthy: sampler");
}

#[tokio::test]
async fn test_readyz_stays_ok_when_attribution_degraded() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;
    state.health_registry.record_attribution(0, 3).await;

    let (status, _) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.inc_ticks();
    state.metrics.set_workloads_tracked(2);
    state.metrics.inc_candidates_rejected("pids_gone");
    state.metrics.add_attribution_failures(&AttributionFailures {
        process_gone: 1,
        ..Default::default()
    });

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("gpu_reclaimer_ticks_total"));
    assert!(metrics_text.contains("gpu_reclaimer_workloads_tracked"));
    assert!(metrics_text.contains("gpu_reclaimer_candidates_rejected_total{reason=\"pids_gone\"}"));
    assert!(metrics_text.contains("gpu_reclaimer_attribution_failures_total{kind=\"process_gone\"}"));
}

#[tokio::test]
async fn test_metrics_contains_histogram_buckets() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_tick_latency(0.001);
    state.metrics.observe_tick_latency(0.2);
    state.metrics.observe_tick_latency(3.0);

    let (_, body) = get(app, "/metrics").await;
    let metrics_text = String::from_utf8(body).unwrap();

    assert!(metrics_text.contains("gpu_reclaimer_tick_latency_seconds_bucket"));
    assert!(metrics_text.contains("gpu_reclaimer_tick_latency_seconds_count"));
    assert!(metrics_text.contains("gpu_reclaimer_tick_latency_seconds_sum"));
}

#[tokio::test]
async fn test_healthz_includes_component_details() {
    let (app, _state) = setup_test_app().await;

    let (_, body) = get(app, "/healthz").await;
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert!(health["components"].is_object());
    assert!(health["components"]["sampler"].is_object());
    assert!(health["components"]["attribution"].is_object());
    assert!(health["components"]["tracker"].is_object());
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let (app, _state) = setup_test_app().await;

    let (status, _) = get(app, "/reclaim").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
