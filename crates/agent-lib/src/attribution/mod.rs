//! Attribution of GPU processes to Kubernetes workloads
//!
//! A pid is resolved in layers:
//! - `/proc/<pid>/cgroup` yields the pod UID and container id
//! - `/proc/<pid>/cmdline` yields the command line (best effort)
//! - the container runtime optionally adds pod name, namespace and
//!   container name, cached per container id

mod cache;
mod cgroup;
mod crictl;

pub use cache::TtlCache;
pub use cgroup::{parse_cgroup, parse_cmdline, CgroupIds};
pub use crictl::{
    find_crictl, parse_inspect_output, ContainerInspector, ContainerMetadata, CrictlInspector,
    EnrichmentError,
};

use crate::models::WorkloadKey;
use crate::observability::ReclaimMetrics;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// How long runtime metadata for a container is reused
pub const METADATA_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Which sources contributed to an attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Only the cgroup path was consulted
    CgroupOnly,
    /// Runtime metadata came from the cache
    EnrichedCached,
    /// Runtime metadata was fetched for this call
    EnrichedFresh,
    /// Enrichment failed or returned nothing usable
    Partial,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::CgroupOnly => "cgroup-only",
            Provenance::EnrichedCached => "enriched-cached",
            Provenance::EnrichedFresh => "enriched-fresh",
            Provenance::Partial => "partial",
        }
    }
}

/// Resolved workload identity of one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub pid: u32,
    pub pod_uid: String,
    pub pod_namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub container_id: String,
    pub cmdline: String,
    pub provenance: Provenance,
}

impl Attribution {
    pub fn key(&self) -> WorkloadKey {
        WorkloadKey {
            uid: self.pod_uid.clone(),
            namespace: self.pod_namespace.clone(),
            name: self.pod_name.clone(),
            container_id: self.container_id.clone(),
        }
    }

    /// Fill fields that are still empty; populated fields are never replaced
    fn merge(&mut self, meta: &ContainerMetadata) {
        fill(&mut self.pod_uid, &meta.pod_uid);
        fill(&mut self.container_id, &meta.container_id);
        fill(&mut self.pod_namespace, &meta.pod_namespace);
        fill(&mut self.pod_name, &meta.pod_name);
        fill(&mut self.container_name, &meta.container_name);
    }
}

fn fill(dst: &mut String, src: &str) {
    if dst.is_empty() {
        *dst = src.to_string();
    }
}

/// Per-pid attribution failures
#[derive(Debug, Error)]
pub enum AttributionError {
    #[error("process {pid} is gone: {source}")]
    ProcessGone {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("no kubernetes identifiers found in cgroup of process {pid}")]
    NoIdentifiers { pid: u32 },

    #[error("attribution of process {pid} timed out after {timeout:?}")]
    TimedOut { pid: u32, timeout: Duration },
}

impl AttributionError {
    /// Stable label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            AttributionError::ProcessGone { .. } => "process_gone",
            AttributionError::NoIdentifiers { .. } => "no_identifiers",
            AttributionError::TimedOut { .. } => "timed_out",
        }
    }
}

/// Resolves a pid to the workload that owns it
#[async_trait]
pub trait PidResolver: Send + Sync {
    async fn resolve(&self, pid: u32) -> Result<Attribution, AttributionError>;
}

/// Resolver backed by `/proc` and an optional container runtime inspector
pub struct AttributionResolver {
    proc_root: PathBuf,
    inspector: Option<Arc<dyn ContainerInspector>>,
    cache: TtlCache<String, ContainerMetadata>,
    metrics: ReclaimMetrics,
}

impl AttributionResolver {
    /// Create a resolver reading from `/proc`
    pub fn new(inspector: Option<Arc<dyn ContainerInspector>>) -> Self {
        Self::with_proc_root("/proc", inspector)
    }

    /// Create a resolver with a custom proc root (for testing)
    pub fn with_proc_root(
        proc_root: impl Into<PathBuf>,
        inspector: Option<Arc<dyn ContainerInspector>>,
    ) -> Self {
        Self {
            proc_root: proc_root.into(),
            inspector,
            cache: TtlCache::new(METADATA_CACHE_TTL),
            metrics: ReclaimMetrics::new(),
        }
    }

    /// Override the metadata cache TTL
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = TtlCache::new(ttl);
        self
    }

    pub fn cache(&self) -> &TtlCache<String, ContainerMetadata> {
        &self.cache
    }

    async fn read_cmdline(&self, pid: u32) -> String {
        match fs::read(self.proc_root.join(pid.to_string()).join("cmdline")).await {
            Ok(raw) => parse_cmdline(&raw),
            Err(_) => String::new(),
        }
    }

    async fn read_cgroup(&self, pid: u32) -> Result<String, AttributionError> {
        fs::read_to_string(self.proc_root.join(pid.to_string()).join("cgroup"))
            .await
            .map_err(|source| AttributionError::ProcessGone { pid, source })
    }
}

#[async_trait]
impl PidResolver for AttributionResolver {
    async fn resolve(&self, pid: u32) -> Result<Attribution, AttributionError> {
        let cmdline = self.read_cmdline(pid).await;
        let cgroup = self.read_cgroup(pid).await?;
        let ids = parse_cgroup(&cgroup);

        let mut attribution = Attribution {
            pid,
            pod_uid: ids.pod_uid.unwrap_or_default(),
            pod_namespace: String::new(),
            pod_name: String::new(),
            container_name: String::new(),
            container_id: ids.container_id.unwrap_or_default(),
            cmdline,
            provenance: Provenance::CgroupOnly,
        };

        let mut enrichment_failed = false;
        if !attribution.container_id.is_empty() {
            if let Some(inspector) = &self.inspector {
                let container_id = attribution.container_id.clone();

                if let Some(meta) = self.cache.get(&container_id) {
                    self.metrics.inc_enrichment_cache_hits();
                    attribution.merge(&meta);
                    attribution.provenance = if meta.is_usable() {
                        Provenance::EnrichedCached
                    } else {
                        Provenance::Partial
                    };
                    return Ok(attribution);
                }
                self.metrics.inc_enrichment_cache_misses();

                match inspector.inspect(&container_id).await {
                    Ok(meta) => {
                        self.cache.insert(container_id, meta.clone());
                        attribution.merge(&meta);
                        attribution.provenance = if meta.is_usable() {
                            Provenance::EnrichedFresh
                        } else {
                            Provenance::Partial
                        };
                        return Ok(attribution);
                    }
                    Err(e) => {
                        self.metrics.inc_enrichment_failures();
                        debug!(pid, container_id = %container_id, error = %e, "Container enrichment failed");
                        enrichment_failed = true;
                    }
                }
            }
        }

        if attribution.pod_uid.is_empty() && attribution.container_id.is_empty() {
            return Err(AttributionError::NoIdentifiers { pid });
        }

        if enrichment_failed {
            attribution.provenance = Provenance::Partial;
        }
        Ok(attribution)
    }
}
