//! Container metadata enrichment through `crictl inspect`

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";
const POD_UID_LABEL: &str = "io.kubernetes.pod.uid";
const CONTAINER_NAME_LABEL: &str = "io.kubernetes.container.name";

const FALLBACK_CRICTL_PATHS: &[&str] = &["/usr/bin/crictl", "/usr/local/bin/crictl"];

/// Workload metadata reported by the container runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMetadata {
    pub pod_uid: String,
    pub pod_namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub container_id: String,
}

impl ContainerMetadata {
    /// Whether the lookup produced a human meaningful identity
    pub fn is_usable(&self) -> bool {
        !self.pod_name.is_empty() || !self.pod_namespace.is_empty()
    }
}

/// Errors from the enrichment collaborator. None of these are fatal.
#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("crictl is not available")]
    Unavailable,

    #[error("failed to run crictl: {0}")]
    Io(#[from] std::io::Error),

    #[error("crictl inspect exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("failed to parse crictl output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Looks up metadata for a container id
#[async_trait]
pub trait ContainerInspector: Send + Sync {
    async fn inspect(&self, container_id: &str) -> Result<ContainerMetadata, EnrichmentError>;
}

/// Inspector that shells out to `crictl`
pub struct CrictlInspector {
    binary: PathBuf,
    runtime_endpoint: Option<String>,
}

impl CrictlInspector {
    /// Locate `crictl` on the node. Returns `None` when it is not installed.
    pub fn discover(runtime_endpoint: Option<String>) -> Option<Self> {
        find_crictl().map(|binary| Self::with_binary(binary, runtime_endpoint))
    }

    /// Use an explicit binary path
    pub fn with_binary(binary: impl Into<PathBuf>, runtime_endpoint: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            runtime_endpoint: runtime_endpoint.filter(|e| !e.trim().is_empty()),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn args<'a>(&'a self, container_id: &'a str) -> Vec<&'a str> {
        let mut args = Vec::with_capacity(6);
        if let Some(endpoint) = &self.runtime_endpoint {
            args.push("-r");
            args.push(endpoint.as_str());
        }
        args.extend(["inspect", "--output", "json", container_id]);
        args
    }
}

#[async_trait]
impl ContainerInspector for CrictlInspector {
    async fn inspect(&self, container_id: &str) -> Result<ContainerMetadata, EnrichmentError> {
        let output = Command::new(&self.binary)
            .args(self.args(container_id))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => EnrichmentError::Unavailable,
                _ => EnrichmentError::Io(e),
            })?;

        if !output.status.success() {
            return Err(EnrichmentError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_inspect_output(container_id, &output.stdout)
    }
}

#[derive(Debug, Default, Deserialize)]
struct InspectOutput {
    info: Option<InspectInfo>,
    status: Option<LabeledSection>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectInfo {
    config: Option<LabeledSection>,
}

#[derive(Debug, Default, Deserialize)]
struct LabeledSection {
    labels: Option<HashMap<String, String>>,
    metadata: Option<NameMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct NameMetadata {
    name: Option<String>,
}

impl LabeledSection {
    fn name(&self) -> &str {
        self.metadata
            .as_ref()
            .and_then(|m| m.name.as_deref())
            .unwrap_or("")
    }
}

/// Parse `crictl inspect --output json`.
///
/// Depending on the crictl version labels live under `info.config` or
/// `status`; both are merged with `status` taking precedence.
pub fn parse_inspect_output(
    container_id: &str,
    json: &[u8],
) -> Result<ContainerMetadata, EnrichmentError> {
    let parsed: InspectOutput = serde_json::from_slice(json)?;
    let config = parsed.info.and_then(|i| i.config).unwrap_or_default();
    let status = parsed.status.unwrap_or_default();

    let mut labels: HashMap<&str, &str> = HashMap::new();
    for section in [&config, &status] {
        if let Some(section_labels) = &section.labels {
            labels.extend(section_labels.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
    }
    let label = |key: &str| labels.get(key).copied().unwrap_or("");

    Ok(ContainerMetadata {
        pod_uid: first_non_empty(&[label(POD_UID_LABEL)]),
        pod_namespace: first_non_empty(&[label(POD_NAMESPACE_LABEL)]),
        pod_name: first_non_empty(&[label(POD_NAME_LABEL)]),
        container_name: first_non_empty(&[
            label(CONTAINER_NAME_LABEL),
            config.name(),
            status.name(),
        ]),
        container_id: container_id.to_string(),
    })
}

fn first_non_empty(values: &[&str]) -> String {
    values
        .iter()
        .find(|v| !v.trim().is_empty())
        .map(|v| v.to_string())
        .unwrap_or_default()
}

/// Find `crictl` on `PATH`, then in the usual install locations
pub fn find_crictl() -> Option<PathBuf> {
    let from_path = std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join("crictl"))
            .find(|candidate| candidate.is_file())
    });

    from_path.or_else(|| {
        FALLBACK_CRICTL_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.is_file())
    })
}
