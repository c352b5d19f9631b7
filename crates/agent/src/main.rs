//! GPU Reclaimer Agent - idle GPU workload detection
//!
//! This binary runs as a DaemonSet on each GPU node, sampling GPU
//! utilization and reporting workloads that hold GPUs without using them.

use agent_lib::{
    attribution::{AttributionResolver, ContainerInspector, CrictlInspector},
    health::HealthRegistry,
    observability::{ReclaimMetrics, StructuredLogger},
    reclaim::TickOrchestratorBuilder,
    sampler::{create_sampler, SamplerKind},
};
use anyhow::Result;
use clap::Parser;
use gpu_reclaimer_agent::{api, config};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = config::Cli::parse();
    let config = config::AgentConfig::load(&cli)?;
    let reclaim_config = config.reclaim_config()?;

    let health_registry = HealthRegistry::for_interval(reclaim_config.sample_interval);

    let metrics = ReclaimMetrics::new();

    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(AGENT_VERSION, config.dry_run, config.sample_interval_seconds);

    let inspector: Option<Arc<dyn ContainerInspector>> =
        match CrictlInspector::discover(config.cri_endpoint.clone()) {
            Some(crictl) => {
                info!(binary = %crictl.binary().display(), "Using crictl for pod metadata");
                Some(Arc::new(crictl))
            }
            None => {
                warn!("crictl not found, pod names and namespaces will be missing");
                None
            }
        };
    let resolver = Arc::new(AttributionResolver::new(inspector));
    let sampler = create_sampler(SamplerKind::parse(&config.sampler));

    let orchestrator = TickOrchestratorBuilder::new()
        .sampler(sampler)
        .resolver(resolver)
        .health(health_registry.clone())
        .config(reclaim_config)
        .build()?;

    let (shutdown_tx, _) = broadcast::channel(1);

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));
    let loop_handle = tokio::spawn(orchestrator.run(shutdown_tx.subscribe()));

    // Mark agent as ready after initialization
    health_registry.set_ready(true).await;

    let reason = wait_for_shutdown().await;
    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    if let Err(e) = loop_handle.await {
        warn!(error = %e, "Reclaim loop terminated abnormally");
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server terminated abnormally"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT and return which one arrived
async fn wait_for_shutdown() -> &'static str {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = signal::ctrl_c().await;
                return "SIGINT received";
            }
        };
        tokio::select! {
            _ = sigterm.recv() => "SIGTERM received",
            _ = signal::ctrl_c() => "SIGINT received",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        "SIGINT received"
    }
}
