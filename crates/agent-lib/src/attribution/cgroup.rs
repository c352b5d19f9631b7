//! Parsing of `/proc/<pid>/cgroup` and `/proc/<pid>/cmdline`

use regex::Regex;
use std::sync::OnceLock;

/// Kubernetes identifiers recovered from a process's cgroup membership
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupIds {
    pub pod_uid: Option<String>,
    pub container_id: Option<String>,
}

fn pod_uid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"pod([0-9a-fA-F]{8}[-_][0-9a-fA-F]{4}[-_][0-9a-fA-F]{4}[-_][0-9a-fA-F]{4}[-_][0-9a-fA-F]{12})",
        )
        .expect("pod uid pattern is valid")
    })
}

fn container_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:^|/)(?:docker-|crio-|cri-containerd-|containerd-)([0-9a-fA-F]{12,64})(?:\.scope)?(?:$|/)",
        )
        .expect("container id pattern is valid")
    })
}

/// Extract the pod UID and container id from cgroup file contents.
///
/// Each line has the form `hierarchy-id:controllers:path`. The first match
/// for each field wins and scanning stops once both are known. Systemd
/// slice names use underscores inside the UID; these are turned back into
/// hyphens. Container ids are lowercased.
pub fn parse_cgroup(content: &str) -> CgroupIds {
    let mut ids = CgroupIds::default();

    for line in content.lines() {
        let parts: Vec<&str> = line.splitn(3, ':').collect();
        if parts.len() != 3 {
            continue;
        }
        let path = parts[2];

        if ids.pod_uid.is_none() {
            if let Some(caps) = pod_uid_re().captures(path) {
                ids.pod_uid = Some(caps[1].replace('_', "-"));
            }
        }
        if ids.container_id.is_none() {
            if let Some(caps) = container_id_re().captures(path) {
                ids.container_id = Some(caps[1].to_ascii_lowercase());
            }
        }
        if ids.pod_uid.is_some() && ids.container_id.is_some() {
            break;
        }
    }

    ids
}

/// Turn NUL separated `cmdline` contents into a single space separated string
pub fn parse_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .map(|arg| String::from_utf8_lossy(arg).trim().to_string())
        .filter(|arg| !arg.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
