use crate::error::ConfigError;
use mirach_collector::ProbeKind;
use mirach_common::codec::CHUNK_SIZE;
use mirach_common::types::{command_topic, data_topic};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "MIRACH_";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Largest data message or chunk fragment, in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub customer: Identity,
    #[serde(default)]
    pub asset: Identity,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginConfig>,
    /// Directory relative paths (TLS files) are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Defaults to `mirach-{asset_id}`.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long a publish waits for the broker's PUBACK.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
    /// How long startup waits for the first CONNACK.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Upper bound for a single MQTT packet; a chunks message carries the
    /// whole payload, so this must exceed the largest expected result.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    pub command_topic: Option<String>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub ca_file: PathBuf,
    pub client_cert_file: Option<PathBuf>,
    pub client_key_file: Option<PathBuf>,
}

/// One `[plugins.<name>]` table. Exactly one of `cmd` and `probe` is set.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    pub schedule: String,
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub probe: Option<ProbeKind>,
    pub label: Option<String>,
    /// Result type of an internal plugin; defaults to the probe name.
    #[serde(rename = "type")]
    pub result_type: Option<String>,
    /// Kill an external command that runs longer than this.
    pub timeout_secs: Option<u64>,
}

fn default_chunk_size() -> usize {
    CHUNK_SIZE
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

fn default_ack_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_max_packet_size() -> usize {
    16 * 1024 * 1024
}

impl AgentConfig {
    /// Reads, applies `MIRACH_*` environment overrides, and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`AgentConfig::load`] with overrides taken from `lookup` instead of
    /// the process environment.
    pub fn load_with<F>(path: impl AsRef<Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        config.apply_env_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses without touching the environment or the filesystem.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Directories searched for `config.toml`, in order.
    pub fn search_dirs() -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(".")];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("mirach"));
        }
        if let Some(home) = dirs::home_dir() {
            let dotconfig = home.join(".config").join("mirach");
            if !candidates.contains(&dotconfig) {
                candidates.push(dotconfig);
            }
        }
        if cfg!(windows) {
            if let Ok(program_data) = std::env::var("PROGRAMDATA") {
                candidates.push(PathBuf::from(program_data).join("mirach"));
            }
        } else {
            candidates.push(PathBuf::from("/etc/mirach"));
        }
        candidates
    }

    /// Returns the first `config.toml` found in `dirs`.
    pub fn find_in_dirs(dirs: &[PathBuf]) -> Result<PathBuf, ConfigError> {
        tracing::debug!(dirs = ?dirs, "Searching for {CONFIG_FILE}");
        dirs.iter()
            .map(|d| d.join(CONFIG_FILE))
            .find(|p| p.is_file())
            .ok_or_else(|| ConfigError::NotFound {
                searched: dirs
                    .iter()
                    .map(|d| d.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    /// Overrides identity and broker address from `MIRACH_*` variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(id) = var("CUSTOMER_ID") {
            self.customer.id = id;
        }
        if let Some(id) = var("ASSET_ID") {
            self.asset.id = id;
        }
        if let Some(host) = var("BROKER_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = var("BROKER_PORT") {
            self.broker.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}BROKER_PORT"),
                value: port,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.customer.id.trim().is_empty() {
            return Err(ConfigError::MissingIdentity("customer.id"));
        }
        if self.asset.id.trim().is_empty() {
            return Err(ConfigError::MissingIdentity("asset.id"));
        }
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "broker.host".to_string(),
                value: self.broker.host.clone(),
            });
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "chunk_size".to_string(),
                value: "0".to_string(),
            });
        }
        if let Some(tls) = &self.broker.tls {
            if tls.client_cert_file.is_some() != tls.client_key_file.is_some() {
                return Err(ConfigError::Tls(
                    "client_cert_file and client_key_file must be set together".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn data_topic(&self) -> String {
        data_topic(&self.customer.id, &self.asset.id)
    }

    pub fn command_topic(&self) -> String {
        self.broker
            .command_topic
            .clone()
            .unwrap_or_else(|| command_topic(&self.customer.id, &self.asset.id))
    }

    pub fn client_id(&self) -> String {
        self.broker
            .client_id
            .clone()
            .unwrap_or_else(|| format!("mirach-{}", self.asset.id))
    }

    /// Resolves `path` against the directory the config was loaded from.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}
