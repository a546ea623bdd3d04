use crate::Probe;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Command;

const PS_FORMAT: &str = "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.State}}\t{{.Status}}";

/// Error fragments that mean "no Docker here", which is a normal condition
/// for this probe rather than a failure.
const UNAVAILABLE_MARKERS: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "Is the docker daemon running",
    "permission denied while trying to connect",
];

/// Lists containers through the `docker` CLI.
pub struct DockerProbe {
    binary: PathBuf,
}

impl Default for DockerProbe {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerProbe {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn snapshot(&self) -> Result<DockerInfo> {
        let output = match Command::new(&self.binary)
            .args(["ps", "--all", "--no-trunc", "--format", PS_FORMAT])
            .output()
        {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(binary = %self.binary.display(), "docker binary not found");
                return Ok(DockerInfo::unavailable());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to run {}", self.binary.display()))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if UNAVAILABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
                tracing::debug!(stderr = %stderr.trim(), "docker daemon not available");
                return Ok(DockerInfo::unavailable());
            }
            bail!("docker ps exited with {}: {}", output.status, stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(DockerInfo::from_containers(parse_ps(&stdout)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStat {
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DockerInfo {
    pub available: bool,
    /// IDs of running containers.
    pub container_ids: Vec<String>,
    pub stats: Vec<ContainerStat>,
}

impl DockerInfo {
    fn unavailable() -> Self {
        Self {
            available: false,
            container_ids: Vec::new(),
            stats: Vec::new(),
        }
    }

    fn from_containers(stats: Vec<ContainerStat>) -> Self {
        let container_ids = stats
            .iter()
            .filter(|c| c.running)
            .map(|c| c.container_id.clone())
            .collect();
        Self {
            available: true,
            container_ids,
            stats,
        }
    }
}

fn parse_ps(stdout: &str) -> Vec<ContainerStat> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut cols = line.splitn(5, '\t');
            let container_id = cols.next()?.trim().to_string();
            let name = cols.next()?.trim().to_string();
            let image = cols.next()?.trim().to_string();
            let state = cols.next()?.trim().to_string();
            let status = cols.next().unwrap_or_default().trim().to_string();
            Some(ContainerStat {
                running: state.eq_ignore_ascii_case("running"),
                container_id,
                name,
                image,
                state,
                status,
            })
        })
        .collect()
}

impl Probe for DockerProbe {
    fn name(&self) -> &str {
        "docker"
    }

    fn collect(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.snapshot()?)?)
    }
}
