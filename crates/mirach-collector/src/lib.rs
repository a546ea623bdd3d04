//! Telemetry probes for the mirach agent.
//!
//! Each [`Probe`] gathers one category of host facts (load, host/CPU
//! details, containers) and renders it as a JSON value. Probes keep no state
//! between calls: every [`Probe::collect`] builds a fresh snapshot.

pub mod docker;
pub mod load;
pub mod sys;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A host data producer used by internal plugins.
///
/// `collect` is blocking and may take a moment (process tables, external
/// commands), so async callers should run it on a blocking thread.
pub trait Probe: Send + Sync {
    /// Returns the probe name (e.g., `"load"`), used as the default result type.
    fn name(&self) -> &str;

    /// Takes a snapshot and renders it as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying system query fails.
    fn collect(&self) -> Result<Value>;
}

/// The built-in probes selectable from configuration.
///
/// # Examples
///
/// ```
/// use mirach_collector::ProbeKind;
///
/// let kind: ProbeKind = "docker".parse().unwrap();
/// assert_eq!(kind, ProbeKind::Docker);
/// assert_eq!(kind.probe().name(), "docker");
/// assert!("disk".parse::<ProbeKind>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Load,
    Sys,
    Docker,
}

impl ProbeKind {
    pub fn probe(self) -> Box<dyn Probe> {
        match self {
            ProbeKind::Load => Box::new(load::LoadProbe),
            ProbeKind::Sys => Box::new(sys::SysProbe),
            ProbeKind::Docker => Box::new(docker::DockerProbe::default()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProbeKind::Load => "load",
            ProbeKind::Sys => "sys",
            ProbeKind::Docker => "docker",
        }
    }
}

impl std::str::FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "load" => Ok(ProbeKind::Load),
            "sys" => Ok(ProbeKind::Sys),
            "docker" => Ok(ProbeKind::Docker),
            _ => Err(format!("unknown probe: {s}")),
        }
    }
}

/// Runs a probe and returns its snapshot as a JSON document.
pub fn collect_json(probe: &dyn Probe) -> Result<String> {
    let value = probe.collect()?;
    Ok(serde_json::to_string(&value)?)
}
