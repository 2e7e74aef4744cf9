//! Client configuration: a TOML (or JSON) file with `[client]` and `[log]`
//! sections, including the per-tunnel table.

use burrow_core::{BurrowError, BurrowResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub log: LogSection,
}

/// `[client]` section of the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Tunnel-channel address of the server.
    pub server_addr: String,
    /// Optional HTTP CONNECT proxy to dial the server through.
    pub http_proxy: String,
    /// Token presented in AuthRequest.User.
    pub auth_token: String,
    /// Named tunnels to establish after authentication.
    pub tunnels: HashMap<String, TunnelSection>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:4443".to_string(),
            http_proxy: String::new(),
            auth_token: String::new(),
            tunnels: HashMap::new(),
        }
    }
}

/// One named tunnel in `[client.tunnels.<name>]`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    pub host_name: String,
    pub sub_domain: String,
    /// Protocol → local address, e.g. `http = "127.0.0.1:9000"`.
    pub protocols: HashMap<String, String>,
    /// Expected `Authorization` header value, e.g. `Basic dXNlcjpwYXNz`.
    pub http_auth: String,
    /// Requested public port for TCP tunnels; 0 lets the server pick.
    pub remote_port: u16,
}

/// `[log]` section of the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    #[serde(rename = "type")]
    pub kind: String,
    pub level: String,
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
