//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `CASTVIEW_URL`, `CASTVIEW_TOKEN`,
//!    `CASTVIEW_LOG`
//! 2. **Config file** — path via `--config <path>`, or `castview.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [relay]
//! url = "wss://relay.example.com/ws"
//!
//! [auth]
//! token = "eyJhbGciOi..."
//!
//! [reconnect]
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//! jitter = 0.2
//!
//! [view]
//! hidden_sessions = ["scratch"]
//! detach_key = "0x1d"   # Ctrl-]
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::connection::{BackoffConfig, ConnectionConfig};
use crate::util::{expand_tilde, parse_key_byte};

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "castview.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid relay URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("relay URL must use ws:// or wss://, got {0:?}")]
    UnsupportedScheme(String),
    #[error("invalid detach key {0:?}")]
    InvalidDetachKey(String),
    #[error("reconnect.jitter must be between 0 and 1, got {0}")]
    InvalidJitter(f64),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub view: ViewConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the relay lives.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// WebSocket endpoint (default `ws://127.0.0.1:8080/ws`). Override with
    /// `CASTVIEW_URL`.
    #[serde(default = "default_url")]
    pub url: String,
}

/// Credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Bearer token sent as the `token` query parameter. Override with
    /// `CASTVIEW_TOKEN`. Without one the client never connects.
    pub token: Option<String>,
}

/// Reconnect backoff.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// First retry delay in milliseconds (default 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on the exponential delay in milliseconds (default 30 000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Random extra delay as a fraction of the computed one (default 0.2).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

/// Presentation preferences.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewConfig {
    /// Session ids left out of listings unless `--all` is given.
    #[serde(default)]
    pub hidden_sessions: Vec<String>,
    /// Key that detaches `attach` (default `0x1d`, Ctrl-]).
    #[serde(default = "default_detach_key")]
    pub detach_key: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`, then
    /// `CASTVIEW_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.2
}
fn default_detach_key() -> String {
    "0x1d".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { url: default_url() }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            hidden_sessions: Vec::new(),
            detach_key: default_detach_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `castview.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(&expand_tilde(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply environment overrides, reading variables through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("CASTVIEW_URL") {
            self.relay.url = url;
        }
        if let Some(token) = var("CASTVIEW_TOKEN") {
            self.auth.token = Some(token);
        }
        if let Some(level) = var("CASTVIEW_LOG") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.relay_url()?;
        self.detach_key()?;
        let jitter = self.reconnect.jitter;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::InvalidJitter(jitter));
        }
        Ok(())
    }

    pub fn relay_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.relay.url).map_err(|source| ConfigError::InvalidUrl {
            url: self.relay.url.clone(),
            source,
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn detach_key(&self) -> Result<u8, ConfigError> {
        parse_key_byte(&self.view.detach_key)
            .ok_or_else(|| ConfigError::InvalidDetachKey(self.view.detach_key.clone()))
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(self.reconnect.base_delay_ms),
            max: Duration::from_millis(self.reconnect.max_delay_ms),
            jitter: self.reconnect.jitter,
        }
    }

    pub fn hidden_sessions(&self) -> HashSet<String> {
        self.view.hidden_sessions.iter().cloned().collect()
    }

    /// Connection identity and timing for the manager.
    pub fn connection(&self) -> Result<ConnectionConfig, ConfigError> {
        Ok(ConnectionConfig {
            url: self.relay_url()?,
            token: self.auth.token.clone().filter(|t| !t.is_empty()),
            backoff: self.backoff(),
        })
    }
}
