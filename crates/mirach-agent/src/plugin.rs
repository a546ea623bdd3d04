use crate::config::{AgentConfig, PluginConfig};
use crate::error::{AgentError, ConfigError};
use crate::logging::truncate_text;
use crate::transport::PublishContext;
use mirach_collector::{collect_json, ProbeKind};
use mirach_common::codec::{self, CodecError};
use mirach_common::types::{Payload, PluginResult};
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

const STDERR_LOG_LIMIT: usize = 512;

/// Why a single plugin execution produced nothing.
///
/// These never leave [`Plugin::run`]; the next scheduled firing is the retry.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("failed to start '{cmd}': {source}")]
    Spawn {
        cmd: String,
        source: std::io::Error,
    },

    #[error("'{cmd}' exited with {status}: {stderr}")]
    ExitStatus {
        cmd: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("'{cmd}' killed after {}s", .timeout.as_secs())]
    Timeout { cmd: String, timeout: Duration },

    #[error("output is not JSON: {0}")]
    Decode(#[from] CodecError),

    #[error("result is not JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("collection failed: {0:#}")]
    Function(anyhow::Error),

    #[error("collection panicked")]
    Panicked,

    #[error("publish failed: {0}")]
    Publish(#[from] AgentError),
}

/// A job backed by an executable; its stdout is the result.
#[derive(Debug, Clone)]
pub struct ExternalPlugin {
    pub name: String,
    pub label: String,
    pub schedule: String,
    pub cmd: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl ExternalPlugin {
    /// Runs the command to completion and decodes the first JSON value on stdout.
    ///
    /// A non-zero exit status fails the run even if stdout holds valid JSON.
    pub async fn execute(&self) -> Result<PluginResult, PluginError> {
        let child = Command::new(&self.cmd)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PluginError::Spawn {
                cmd: self.cmd.clone(),
                source,
            })?;

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| PluginError::Timeout {
                    cmd: self.cmd.clone(),
                    timeout,
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|source| PluginError::Spawn {
            cmd: self.cmd.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PluginError::ExitStatus {
                cmd: self.cmd.clone(),
                status: output.status,
                stderr: truncate_text(stderr.trim(), STDERR_LOG_LIMIT),
            });
        }

        let raw = codec::first_json_value(&output.stdout)?;
        Ok(PluginResult::new(self.label.clone(), Payload::Raw(raw)))
    }
}

/// In-process collection function returning a JSON document.
pub type CollectFn = Arc<dyn Fn() -> anyhow::Result<String> + Send + Sync>;

/// A job backed by a function, usually one of the built-in probes.
#[derive(Clone)]
pub struct InternalPlugin {
    pub name: String,
    pub schedule: String,
    pub result_type: String,
    pub func: CollectFn,
}

impl fmt::Debug for InternalPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalPlugin")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("result_type", &self.result_type)
            .finish_non_exhaustive()
    }
}

impl InternalPlugin {
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        result_type: impl Into<String>,
        func: impl Fn() -> anyhow::Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            result_type: result_type.into(),
            func: Arc::new(func),
        }
    }

    /// A plugin that takes a fresh snapshot of `kind` on every run.
    pub fn for_probe(name: impl Into<String>, schedule: impl Into<String>, kind: ProbeKind) -> Self {
        Self::new(name, schedule, kind.as_str(), move || {
            collect_json(kind.probe().as_ref())
        })
    }

    /// Calls the function on a blocking thread and decodes its output.
    pub async fn execute(&self) -> Result<PluginResult, PluginError> {
        let func = self.func.clone();
        let json = tokio::task::spawn_blocking(move || func())
            .await
            .map_err(|_| PluginError::Panicked)?
            .map_err(PluginError::Function)?;
        let data = Payload::from_json_str(&json)?;
        Ok(PluginResult::new(self.result_type.clone(), data))
    }
}

/// A scheduled unit of work. Immutable once built.
#[derive(Debug, Clone)]
pub enum Plugin {
    External(ExternalPlugin),
    Internal(InternalPlugin),
}

impl Plugin {
    /// Builds a plugin from its `[plugins.<name>]` table.
    ///
    /// # Examples
    ///
    /// ```
    /// use mirach_agent::config::PluginConfig;
    /// use mirach_agent::plugin::Plugin;
    ///
    /// let cfg: PluginConfig = toml::from_str(r#"
    ///     probe = "load"
    ///     schedule = "*/30 * * * * *"
    /// "#).unwrap();
    /// let plugin = Plugin::from_config("load", &cfg).unwrap();
    /// assert_eq!(plugin.label(), "load");
    /// ```
    pub fn from_config(name: &str, cfg: &PluginConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPlugin {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if cfg.schedule.trim().is_empty() {
            return Err(invalid("schedule is empty"));
        }

        match (&cfg.cmd, cfg.probe) {
            (Some(cmd), None) => {
                if cmd.trim().is_empty() {
                    return Err(invalid("cmd is empty"));
                }
                if cfg.result_type.is_some() {
                    return Err(invalid("`type` applies to probes only, use `label`"));
                }
                Ok(Plugin::External(ExternalPlugin {
                    name: name.to_string(),
                    label: cfg.label.clone().unwrap_or_else(|| name.to_string()),
                    schedule: cfg.schedule.clone(),
                    cmd: cmd.clone(),
                    args: cfg.args.clone(),
                    timeout: cfg.timeout_secs.map(Duration::from_secs),
                }))
            }
            (None, Some(kind)) => {
                if !cfg.args.is_empty() || cfg.timeout_secs.is_some() {
                    return Err(invalid("args and timeout_secs apply to cmd plugins only"));
                }
                let mut plugin = InternalPlugin::for_probe(name, cfg.schedule.clone(), kind);
                if let Some(result_type) = cfg.result_type.clone().or_else(|| cfg.label.clone()) {
                    plugin.result_type = result_type;
                }
                Ok(Plugin::Internal(plugin))
            }
            (Some(_), Some(_)) => Err(invalid("set either cmd or probe, not both")),
            (None, None) => Err(invalid("one of cmd or probe is required")),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Plugin::External(p) => &p.name,
            Plugin::Internal(p) => &p.name,
        }
    }

    /// The `type` of every result this plugin produces.
    pub fn label(&self) -> &str {
        match self {
            Plugin::External(p) => &p.label,
            Plugin::Internal(p) => &p.result_type,
        }
    }

    pub fn schedule(&self) -> &str {
        match self {
            Plugin::External(p) => &p.schedule,
            Plugin::Internal(p) => &p.schedule,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Plugin::External(_))
    }

    pub async fn execute(&self) -> Result<PluginResult, PluginError> {
        match self {
            Plugin::External(p) => p.execute().await,
            Plugin::Internal(p) => p.execute().await,
        }
    }

    /// Executes once and publishes the result. Failures are logged, never returned.
    pub async fn run(&self, ctx: &PublishContext) {
        let started = std::time::Instant::now();
        let outcome = match self.execute().await {
            Ok(result) => ctx
                .publish_result(&result)
                .await
                .map_err(PluginError::from),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(encoded) => tracing::info!(
                plugin = %self.name(),
                kind = %self.label(),
                topic = %ctx.topic(),
                bytes = encoded.result_len,
                chunks = encoded.fragments,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Published result"
            ),
            Err(e) => tracing::error!(
                plugin = %self.name(),
                kind = %self.label(),
                error = %e,
                "Plugin run failed"
            ),
        }
    }
}

/// Builds every configured plugin, in name order.
pub fn build_plugins(config: &AgentConfig) -> Result<Vec<Plugin>, ConfigError> {
    config
        .plugins
        .iter()
        .map(|(name, cfg)| Plugin::from_config(name, cfg))
        .collect()
}
