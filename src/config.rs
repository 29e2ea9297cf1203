//! Global configuration parsing and validation.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

fn default_host_cli() -> String {
    "claude".into()
}

fn default_bind_host() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_http_port() -> u16 {
    3002
}

fn default_db_path() -> PathBuf {
    PathBuf::from("assistant-relay.db")
}

fn default_idle_timeout_seconds() -> u64 {
    600
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".into(),
        "http://localhost:3001".into(),
        "http://localhost:3002".into(),
    ]
}

/// Global configuration parsed from `config.toml`.
///
/// Every field has a default so the relay can start without a config file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// External assistant binary (e.g., `claude`).
    #[serde(default = "default_host_cli")]
    pub host_cli: String,
    /// Extra arguments placed before the composed invocation flags.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
    /// Address the HTTP server binds to.
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,
    /// HTTP port for the relay; `0` picks an ephemeral port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// `SQLite` database file, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Seconds without output before a request is abandoned; 0 disables.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    /// Browser origins permitted by CORS.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            host_cli: default_host_cli(),
            host_cli_args: Vec::new(),
            bind_host: default_bind_host(),
            http_port: default_http_port(),
            db_path: default_db_path(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Socket address for the HTTP listener.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.http_port)
    }

    /// Idle timeout as a [`Duration`], or `None` when disabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_seconds > 0).then(|| Duration::from_secs(self.idle_timeout_seconds))
    }

    /// Whether the store should be kept in memory only.
    #[must_use]
    pub fn uses_memory_db(&self) -> bool {
        self.db_path.as_os_str() == ":memory:"
    }

    fn validate(&self) -> Result<()> {
        if self.host_cli.trim().is_empty() {
            return Err(AppError::Config("host_cli must not be empty".into()));
        }
        Ok(())
    }
}
