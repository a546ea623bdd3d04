use std::path::PathBuf;

/// Errors raised while reading or validating the agent configuration.
///
/// All of these are fatal at startup.
///
/// # Examples
///
/// ```rust
/// use mirach_agent::error::ConfigError;
///
/// let err = ConfigError::MissingIdentity("customer.id");
/// assert!(err.to_string().contains("customer.id"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config: failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Config: failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Config: no config.toml found in {searched}")]
    NotFound { searched: String },

    /// Customer or asset identity is empty.
    #[error("Config: missing {0}")]
    MissingIdentity(&'static str),

    #[error("Config: invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Config: plugin '{name}': {reason}")]
    InvalidPlugin { name: String, reason: String },

    #[error("Config: TLS: {0}")]
    Tls(String),
}

/// Errors from the scheduler, transport and command listener.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid schedule '{schedule}' for plugin '{plugin}': {reason}")]
    InvalidSchedule {
        plugin: String,
        schedule: String,
        reason: String,
    },

    #[error("plugin '{0}' is already registered")]
    DuplicatePlugin(String),

    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("scheduler is stopped")]
    SchedulerStopped,

    /// Connecting to or publishing through the broker failed.
    #[error("transport: {0}")]
    Transport(String),

    #[error("subscription to '{topic}' failed: {reason}")]
    Subscription { topic: String, reason: String },
}

pub type Result<T> = std::result::Result<T, AgentError>;
