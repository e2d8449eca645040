//! TOML-based server configuration.
//!
//! Every tunable the multiplexer consults lives in [`ServerConfig`], which
//! is injected by value at construction; nothing reads ambient state, so a
//! test can build a custom record and pass it in. The binary loads an
//! [`AppConfig`] (server + network sections) from a TOML file:
//!
//! ```toml
//! [server]
//! name = "office desktop"
//! frame-rate = 60
//! compare-fb = "auto"
//! max-idle-time = 3600
//!
//! [network]
//! bind_address = "0.0.0.0"
//! port = 5900
//! ```
//!
//! Fields annotated with `#[serde(default = "...")]` take their default
//! when absent, so a partial (or missing) file always yields a complete,
//! working configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::blacklist::BlacklistConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
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
}

/// When the framebuffer comparer runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareMode {
    /// Never compare; all reported damage is sent.
    Off,
    /// Always compare.
    #[default]
    On,
    /// Compare iff at least one connected client opts in.
    Auto,
}

/// One keysym substitution applied to incoming key events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyMapping {
    pub from: u32,
    pub to: u32,
}

/// Top-level configuration as stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Everything the multiplexer consults at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Desktop name announced to clients.
    #[serde(default = "default_name")]
    pub name: String,

    /// Frame clock rate in Hz.
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Framebuffer comparison policy.
    #[serde(default)]
    pub compare_fb: CompareMode,

    /// Seconds without client input before the server exits. 0 disables.
    #[serde(default)]
    pub max_idle_time: u64,

    /// Seconds without any client connected before the server exits.
    /// 0 disables.
    #[serde(default)]
    pub max_disconnection_time: u64,

    /// Seconds after the first client connects before the server exits.
    /// 0 disables.
    #[serde(default)]
    pub max_connection_time: u64,

    /// Accept keyboard events from clients.
    #[serde(default = "default_true")]
    pub accept_key_events: bool,

    /// Accept pointer events from clients.
    #[serde(default = "default_true")]
    pub accept_pointer_events: bool,

    /// Accept clipboard contents from clients.
    #[serde(default = "default_true")]
    pub accept_cut_text: bool,

    /// Send clipboard contents to clients.
    #[serde(default = "default_true")]
    pub send_cut_text: bool,

    /// Accept client framebuffer resize requests.
    #[serde(default = "default_true")]
    pub accept_set_desktop_size: bool,

    /// Ask the desktop to approve every incoming connection.
    #[serde(default)]
    pub query_connect: bool,

    /// Never treat the desktop as shared, regardless of client wishes.
    #[serde(default)]
    pub never_shared: bool,

    /// When a client connects non-shared, disconnect the others instead of
    /// refusing the newcomer.
    #[serde(default = "default_true")]
    pub disconnect_clients: bool,

    /// Keysym substitutions applied to incoming key events.
    #[serde(default)]
    pub key_remap: Vec<KeyMapping>,

    /// Authentication-failure rate limiting.
    #[serde(default)]
    pub blacklist: BlacklistConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            frame_rate: default_frame_rate(),
            compare_fb: CompareMode::default(),
            max_idle_time: 0,
            max_disconnection_time: 0,
            max_connection_time: 0,
            accept_key_events: true,
            accept_pointer_events: true,
            accept_cut_text: true,
            send_cut_text: true,
            accept_set_desktop_size: true,
            query_connect: false,
            never_shared: false,
            disconnect_clients: true,
            key_remap: Vec::new(),
            blacklist: BlacklistConfig::default(),
        }
    }
}

/// Listener settings for the socket carrier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// IP address to bind. `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_name() -> String {
    "rfbmux".to_string()
}
fn default_frame_rate() -> u32 {
    60
}
fn default_true() -> bool {
    true
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5900
}

/// Loads configuration from `path`.
pub fn load(path: &Path) -> Result<AppConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
