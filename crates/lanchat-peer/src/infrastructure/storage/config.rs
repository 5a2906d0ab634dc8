//! TOML-based configuration persistence for the LanChat peer.
//!
//! Reads and writes [`ChatConfig`] to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\LanChat\config.toml`
//! - Linux:    `~/.config/lanchat/config.toml`
//! - macOS:    `~/Library/Application Support/LanChat/config.toml`
//!
//! ```toml
//! [profile]
//! display_name = "Alice"
//! log_level = "info"
//!
//! [network]
//! bind_address = "0.0.0.0"
//! port = 0
//!
//! [discovery]
//! service_type = "_lanchat._tcp.local."
//! ```
//!
//! Every field has a `#[serde(default = "...")]` helper, so a missing file or
//! a file from an older version still loads.

use std::path::{Path, PathBuf};

use lanchat_core::protocol::DEFAULT_MAX_PAYLOAD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::discovery::DEFAULT_SERVICE_TYPE;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatConfig {
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Who this peer is and how it logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileConfig {
    /// Schema version string; bump when breaking changes are introduced.
    #[serde(default = "default_version")]
    pub version: String,
    /// Name advertised to other peers.  Falls back to the host name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Listener and transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Address the chat listener binds to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port for the listener.  `0` lets the OS choose; the chosen port is
    /// advertised over mDNS.
    #[serde(default)]
    pub port: u16,
    /// Upper bound on the pre-shared-key handshake.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Idle seconds before TCP keepalive probes start.
    #[serde(default = "default_keepalive_idle_secs")]
    pub keepalive_idle_secs: u64,
    /// Largest message payload accepted from a peer.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

/// Service browsing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    /// DNS-SD service type, e.g. `"_lanchat._tcp.local."`.
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Delay before a browse is restarted after a defunct daemon connection.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_version() -> String {
    "1.0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_keepalive_idle_secs() -> u64 {
    2
}
fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD
}
fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.to_string()
}
fn default_restart_delay_ms() -> u64 {
    1_000
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            display_name: None,
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: 0,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            keepalive_idle_secs: default_keepalive_idle_secs(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the base directory cannot
/// be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads [`ChatConfig`] from the platform config file, returning defaults if
/// the file does not exist yet.
pub fn load_config() -> Result<ChatConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads [`ChatConfig`] from `path`, returning defaults if it does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<ChatConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ChatConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to the platform config file.
pub fn save_config(config: &ChatConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_file_path()?)
}

/// Persists `config` to `path`, creating parent directories as needed.
pub fn save_config_to(config: &ChatConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("LanChat"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("lanchat"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("LanChat")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
