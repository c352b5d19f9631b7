//! Agent configuration
//!
//! Settings are layered, lowest precedence first: built-in defaults, an
//! optional config file, environment variables, then command-line flags.

use agent_lib::reclaim::{ReclaimConfig, DEFAULT_PROCESS_ALLOWLIST};
use anyhow::{bail, Context, Result};
use clap::Parser;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variables read by the agent
const ENV_KEYS: &[&str] = &[
    "IDLE_MINUTES",
    "SAMPLE_INTERVAL_SECONDS",
    "CONSECUTIVE_IDLE_SAMPLES",
    "GPU_UTIL_THRESHOLD_PERCENT",
    "DRY_RUN",
    "CRI_ENDPOINT",
    "PROCESS_ALLOWLIST_REGEX",
    "SAMPLER",
    "NODE_NAME",
    "API_PORT",
];

/// Command-line flags. Every flag overrides the matching setting.
#[derive(Debug, Default, Parser)]
#[command(name = "gpu-reclaimer-agent")]
#[command(version, about = "Detects idle GPU workloads and reports reclaim candidates", long_about = None)]
pub struct Cli {
    /// Path to a config file (TOML, YAML or JSON)
    #[arg(long, env = "GPU_RECLAIMER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Minutes a workload must stay idle before it becomes a candidate
    #[arg(long)]
    pub idle_minutes: Option<u32>,

    /// Seconds between samples
    #[arg(long = "sample-interval", value_name = "SECONDS")]
    pub sample_interval_seconds: Option<u64>,

    /// Consecutive idle samples required before a candidate is emitted
    #[arg(long)]
    pub consecutive_idle_samples: Option<u32>,

    /// GPU utilization percent below which a GPU counts as idle
    #[arg(long = "gpu-util-threshold", value_name = "PERCENT")]
    pub gpu_util_threshold_percent: Option<u32>,

    /// Only log candidates. A bare `--dry-run` means true; `--dry-run false`
    /// overrides a true setting from the file or environment.
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    pub dry_run: Option<bool>,

    /// CRI runtime endpoint passed to crictl
    #[arg(long)]
    pub cri_endpoint: Option<String>,

    /// Regex of command lines that are never attributed
    #[arg(long)]
    pub process_allowlist_regex: Option<String>,

    /// GPU sampler backend: nvml or nvidia-smi
    #[arg(long)]
    pub sampler: Option<String>,

    /// Node name reported with every candidate
    #[arg(long)]
    pub node_name: Option<String>,

    /// Port for the health and metrics server
    #[arg(long)]
    pub api_port: Option<u16>,
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub idle_minutes: u32,
    pub sample_interval_seconds: u64,
    pub consecutive_idle_samples: u32,
    pub gpu_util_threshold_percent: u32,
    pub dry_run: bool,
    #[serde(default)]
    pub cri_endpoint: Option<String>,
    pub process_allowlist_regex: String,
    pub sampler: String,
    /// Node name from Kubernetes downward API
    #[serde(default)]
    pub node_name: String,
    /// API server port for health/metrics
    pub api_port: u16,
}

impl AgentConfig {
    /// Load configuration from the process environment and flags
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_with_env(cli, std::env::vars().collect())
    }

    /// Load configuration from an explicit environment
    pub fn load_with_env(cli: &Cli, env: HashMap<String, String>) -> Result<Self> {
        let known: HashMap<String, String> = env
            .iter()
            .filter(|(key, _)| ENV_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let mut builder = config::Config::builder()
            .set_default("idle_minutes", 30)?
            .set_default("sample_interval_seconds", 60)?
            .set_default("consecutive_idle_samples", 30)?
            .set_default("gpu_util_threshold_percent", 1)?
            .set_default("dry_run", false)?
            .set_default("process_allowlist_regex", DEFAULT_PROCESS_ALLOWLIST)?
            .set_default("sampler", "nvml")?
            .set_default("api_port", 8080)?;

        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::default()
                    .source(Some(known))
                    .try_parsing(true)
                    .ignore_empty(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let mut config: AgentConfig = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.apply_flags(cli);

        if config.node_name.is_empty() {
            config.node_name = env
                .get("HOSTNAME")
                .filter(|name| !name.is_empty())
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_flags(&mut self, cli: &Cli) {
        if let Some(v) = cli.idle_minutes {
            self.idle_minutes = v;
        }
        if let Some(v) = cli.sample_interval_seconds {
            self.sample_interval_seconds = v;
        }
        if let Some(v) = cli.consecutive_idle_samples {
            self.consecutive_idle_samples = v;
        }
        if let Some(v) = cli.gpu_util_threshold_percent {
            self.gpu_util_threshold_percent = v;
        }
        if let Some(v) = cli.dry_run {
            self.dry_run = v;
        }
        if let Some(v) = &cli.cri_endpoint {
            self.cri_endpoint = Some(v.clone());
        }
        if let Some(v) = &cli.process_allowlist_regex {
            self.process_allowlist_regex = v.clone();
        }
        if let Some(v) = &cli.sampler {
            self.sampler = v.clone();
        }
        if let Some(v) = &cli.node_name {
            self.node_name = v.clone();
        }
        if let Some(v) = cli.api_port {
            self.api_port = v;
        }
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        Regex::new(&self.process_allowlist_regex).with_context(|| {
            format!(
                "Invalid process allow-list regex {:?}",
                self.process_allowlist_regex
            )
        })?;
        if self.sample_interval_seconds == 0 {
            bail!("Sample interval must be greater than zero");
        }
        if self.consecutive_idle_samples < 1 {
            bail!("Consecutive idle samples must be at least 1");
        }
        if self.gpu_util_threshold_percent > 100 {
            bail!(
                "GPU utilization threshold must be between 0 and 100, got {}",
                self.gpu_util_threshold_percent
            );
        }
        Ok(())
    }

    /// Settings for the reclaim loop
    pub fn reclaim_config(&self) -> Result<ReclaimConfig> {
        Ok(ReclaimConfig {
            idle_minutes: self.idle_minutes,
            sample_interval: Duration::from_secs(self.sample_interval_seconds),
            consecutive_idle_samples: self.consecutive_idle_samples,
            gpu_util_threshold_pct: self.gpu_util_threshold_percent,
            process_allowlist: Regex::new(&self.process_allowlist_regex)?,
            dry_run: self.dry_run,
            node_name: self.node_name.clone(),
            ..ReclaimConfig::default()
        })
    }
}
