//! ResistNet configuration file handling.
//!
//! Configuration is TOML, stored under the platform data directory by
//! default. Everything that is policy (permission thresholds, timeouts,
//! retry schedule) lives here so it can change without a rebuild.
//!
//! Credentials may come from the environment instead of the file:
//! `PASSPORT_API_KEY`, `PASSPORT_SCORER_ID`, `PASSPORT_API_BASE_URL`.

use crate::policy::PolicyThresholds;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

/// Default Human Passport API endpoint
pub const DEFAULT_PASSPORT_BASE_URL: &str = "https://api.passport.xyz";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResistConfig {
    #[serde(default)]
    pub passport: PassportConfig,

    #[serde(default)]
    pub policy: PolicyThresholds,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Human Passport reputation API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassportConfig {
    #[serde(default = "default_passport_base_url")]
    pub base_url: String,

    /// Sent as `X-API-KEY`. Prefer `PASSPORT_API_KEY` over writing it to disk.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub scorer_id: Option<String>,
}

impl Default for PassportConfig {
    fn default() -> Self {
        Self {
            base_url: default_passport_base_url(),
            api_key: None,
            scorer_id: None,
        }
    }
}

/// Which content-addressed store backs publications and evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// In-process map; content is lost on restart.
    #[default]
    Memory,
    /// One file per CID under `storage.path`.
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageKind,

    /// Required when `backend = "file"`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Messages retained per topic for history queries.
    #[serde(default = "default_history_retention")]
    pub history_retention: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            history_retention: default_history_retention(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Number of secret-sharing nodes each secret is split across.
    #[serde(default = "default_node_count")]
    pub node_count: usize,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            node_count: default_node_count(),
        }
    }
}

/// Upper bounds on external calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_request_timeout", with = "humantime_duration")]
    pub reputation: Duration,

    #[serde(default = "default_request_timeout", with = "humantime_duration")]
    pub storage: Duration,

    #[serde(default = "default_request_timeout", with = "humantime_duration")]
    pub transport: Duration,

    #[serde(default = "default_request_timeout", with = "humantime_duration")]
    pub compute: Duration,

    /// How long threshold signing waits for custodians.
    #[serde(default = "default_signing_timeout", with = "humantime_duration")]
    pub signing: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            reputation: default_request_timeout(),
            storage: default_request_timeout(),
            transport: default_request_timeout(),
            compute: default_request_timeout(),
            signing: default_signing_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins if set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

fn default_passport_base_url() -> String {
    DEFAULT_PASSPORT_BASE_URL.to_string()
}

fn default_history_retention() -> usize {
    1000
}

fn default_node_count() -> usize {
    3
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_signing_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl ResistConfig {
    /// Load configuration from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: ResistConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Pull credentials from the environment when present.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("PASSPORT_API_KEY") {
            self.passport.api_key = Some(key);
        }
        if let Ok(scorer) = std::env::var("PASSPORT_SCORER_ID") {
            self.passport.scorer_id = Some(scorer);
        }
        if let Ok(url) = std::env::var("PASSPORT_API_BASE_URL") {
            self.passport.base_url = url;
        }
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.passport.api_key.is_some()
            && self.passport.scorer_id.as_deref().unwrap_or("").is_empty()
        {
            return Err(ConfigError::Invalid(
                "passport.scorer_id is required when an API key is configured".to_string(),
            ));
        }

        if self.secrets.node_count < 2 {
            return Err(ConfigError::Invalid(
                "secrets.node_count must be at least 2".to_string(),
            ));
        }

        if self.storage.backend == StorageKind::File && self.storage.path.is_none() {
            return Err(ConfigError::Invalid(
                "storage.path is required for the file backend".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Generate the default configuration as commented TOML.
    pub fn generate_default_toml(data_dir: &Path) -> String {
        format!(
            r#"# ResistNet configuration
#
# Credentials can be supplied through the environment instead:
#   PASSPORT_API_KEY, PASSPORT_SCORER_ID, PASSPORT_API_BASE_URL

[passport]
base_url = "{base_url}"
# scorer_id = "1234"

# Minimum Human Passport score per action
[policy]
publish = 15.0
vote = 10.0
upload_evidence = 20.0
report_abuse = 15.0
grant_access = 25.0
emergency_alert = 30.0
witness = 20.0
create_proposal = 15.0

[storage]
# "memory" (lost on restart) or "file"
backend = "file"
path = "{content_dir}"

[transport]
history_retention = 1000

[secrets]
node_count = 3

[timeouts]
reputation = "10s"
storage = "10s"
transport = "10s"
compute = "10s"
signing = "10s"

[retry]
max_attempts = 4
base_delay = "250ms"
max_delay = "8s"

[logging]
level = "info"
"#,
            base_url = DEFAULT_PASSPORT_BASE_URL,
            content_dir = data_dir.join("content").display(),
        )
    }

    /// Write the default configuration to `path`.
    pub fn create_default(path: &Path, data_dir: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        fs::write(path, Self::generate_default_toml(data_dir)).map_err(|source| {
            ConfigError::Write {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}

/// Default data directory (`~/.local/share/resistnet` on Linux).
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("resistnet")
}

/// Default config file location inside the data directory.
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

/// Serde adapter for durations written as humantime strings ("10s", "250ms").
pub mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
