//! Server configuration: a TOML (or JSON) file with `[server]` and `[log]`
//! sections.

use burrow_core::{BurrowError, BurrowResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogSection,
}

/// `[server]` section of the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Public address for HTTP tunnels; empty disables the listener.
    pub http_addr: String,
    /// Public address for HTTPS tunnels; empty disables the listener.
    pub https_addr: String,
    /// Address clients dial for control and proxy connections.
    pub client_tunnel_addr: String,
    /// Domain the tunnels are hosted under.
    pub domain: String,
    /// Path to the TLS certificate PEM file (HTTPS listener).
    pub tls_crt: String,
    /// Path to the TLS private key PEM file (HTTPS listener).
    pub tls_key: String,
    pub conn_read_timeout_sec: u64,
    pub conn_write_timeout_sec: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: String::new(),
            https_addr: String::new(),
            client_tunnel_addr: ":4443".to_string(),
            domain: "localhost".to_string(),
            tls_crt: String::new(),
            tls_key: String::new(),
            conn_read_timeout_sec: 10,
            conn_write_timeout_sec: 10,
        }
    }
}

/// `[log]` section of the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Logger backend tag; only "std" is built in.
    #[serde(rename = "type")]
    pub kind: String,
    /// Default level when RUST_LOG is unset.
    pub level: String,
    /// "text" or "json".
    pub format: String,
    pub outputs: Vec<String>,
    pub error_outputs: Vec<String>,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            kind: "std".to_string(),
            level: "info".to_string(),
            format: "text".to_string(),
            outputs: vec!["stdout".to_string()],
            error_outputs: vec!["stderr".to_string()],
        }
    }
}

/// Load a config file in the given format ("toml" or "json").
pub fn load(path: &Path, format: &str) -> BurrowResult<ConfigFile> {
    info!(path = %path.display(), format = %format, "loading config file");
    let content = std::fs::read_to_string(path)?;
    parse(&content, format)
}

pub(crate) fn parse(content: &str, format: &str) -> BurrowResult<ConfigFile> {
    match format {
        "toml" => toml::from_str(content)
            .map_err(|e| BurrowError::Other(format!("config parse error: {e}"))),
        "json" => serde_json::from_str(content)
            .map_err(|e| BurrowError::Other(format!("config parse error: {e}"))),
        other => Err(BurrowError::Other(format!(
            "unsupported config type: {other}"
        ))),
    }
}

/// Default config path: `$HOME/.burrow.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".burrow.toml")
}
