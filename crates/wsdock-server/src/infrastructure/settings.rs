//! Optional TOML settings file for the `wsdock` binary.
//!
//! Every field has a default, so an empty file (or no file at all) yields the
//! same configuration as `ServerConfig::default()`.  Values given on the
//! command line override the file.
//!
//! ```toml
//! [server]
//! host = "192.168.1.20"      # omit to use the machine's LAN address
//! ports = [1024, 2048]
//! max_frame_size = 2097152
//! path = "/websocket"
//!
//! [tls]
//! p12_path = "server.p12"
//! passphrase = "changeit"
//!
//! [logging]
//! level = "debug"
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::domain::config::{
    DEFAULT_BACKLOG, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORTS, DEFAULT_UPGRADE_PATH,
};
use crate::domain::{ServerConfig, TlsMode};

/// Error type for settings file operations.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error reading settings at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but a value is out of range.
    #[error("invalid setting: {0}")]
    Invalid(String),
}

// ── Schema ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Bind address.  Absent means "resolve the LAN address at start".
    #[serde(default)]
    pub host: Option<IpAddr>,
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

/// At most one of `p12_path` and `embedded` may be set.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TlsSettings {
    #[serde(default)]
    pub p12_path: Option<PathBuf>,
    /// Reversed base64 bundle text.
    #[serde(default)]
    pub embedded: Option<String>,
    #[serde(default)]
    pub passphrase: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    /// `tracing` filter used when `RUST_LOG` is unset, e.g. `"info"` or
    /// `"wsdock_server=debug"`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_ports() -> Vec<u16> {
    DEFAULT_PORTS.to_vec()
}
fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}
fn default_path() -> String {
    DEFAULT_UPGRADE_PATH.to_string()
}
fn default_close_timeout_secs() -> u64 {
    5
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: None,
            ports: default_ports(),
            max_frame_size: default_max_frame_size(),
            path: default_path(),
            close_timeout_secs: default_close_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            backlog: default_backlog(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl Settings {
    /// Reads and validates the settings file at `path`.
    ///
    /// # Errors
    ///
    /// [`SettingsError::Io`] if the file cannot be read (a missing file is an
    /// error here: the caller asked for it explicitly), [`SettingsError::Parse`]
    /// for malformed TOML and [`SettingsError::Invalid`] for bad values.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let server = &self.server;
        if server.ports.is_empty() {
            return Err(SettingsError::Invalid("server.ports must not be empty".into()));
        }
        if server.ports.contains(&0) {
            return Err(SettingsError::Invalid(
                "server.ports must not contain 0".into(),
            ));
        }
        if server.max_frame_size == 0 {
            return Err(SettingsError::Invalid(
                "server.max_frame_size must be positive".into(),
            ));
        }
        if !server.path.starts_with('/') {
            return Err(SettingsError::Invalid(format!(
                "server.path must start with '/': {:?}",
                server.path
            )));
        }
        if self.tls.p12_path.is_some() && self.tls.embedded.is_some() {
            return Err(SettingsError::Invalid(
                "tls.p12_path and tls.embedded are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    /// The engine configuration these settings describe.
    pub fn to_server_config(&self) -> ServerConfig {
        let server = &self.server;
        let tls = match (&self.tls.p12_path, &self.tls.embedded) {
            (Some(path), _) => TlsMode::Pkcs12File {
                path: path.clone(),
                passphrase: self.tls.passphrase.clone(),
            },
            (None, Some(encoded)) => TlsMode::Embedded {
                encoded: encoded.clone(),
                passphrase: self.tls.passphrase.clone(),
            },
            (None, None) => TlsMode::None,
        };
        ServerConfig {
            host: server.host,
            ports: server.ports.clone(),
            max_frame_size: server.max_frame_size,
            tls,
            path: server.path.clone(),
            close_timeout: Duration::from_secs(server.close_timeout_secs),
            handshake_timeout: Duration::from_secs(server.handshake_timeout_secs),
            backlog: server.backlog,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
