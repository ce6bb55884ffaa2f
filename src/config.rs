//! Static configuration: YAML file merged with command-line flags

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_RELAY_URL: &str = "https://relay.cloudlink.dev";
pub const DEFAULT_RELAY_TUNNEL_PORT: u16 = 4001;
pub const DEFAULT_TARGET: &str = "127.0.0.1:10080";

/// `cloudlink.yaml`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: RelayFileConfig,

    #[serde(default)]
    pub server: ServerFileConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RelayFileConfig {
    /// REST origin, e.g. `https://relay.example.com`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Host reverse connections are dialed to; defaults to the url's host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_port: Option<u16>,

    /// Skip certificate verification on reverse connections
    #[serde(default)]
    pub insecure: bool,

    /// Static push registration id used when no push transport is attached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    /// Internal application, `host:port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Loopback listener for relay traffic; 0 picks a free port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_port: Option<u16>,

    /// Use this tunnel binary instead of downloading one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_binary: Option<PathBuf>,
}

/// Values given on the command line; each overrides the file
#[derive(Debug, Default)]
pub struct Overrides {
    pub relay_url: Option<String>,
    pub relay_tunnel_host: Option<String>,
    pub relay_tunnel_port: Option<u16>,
    pub insecure_relay: bool,
    pub registration_id: Option<String>,
    pub target: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub internal_port: Option<u16>,
    pub tunnel_binary: Option<PathBuf>,
    pub log_level: Option<String>,
}

/// Fully resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub relay_url: String,
    pub relay_tunnel_host: String,
    pub relay_tunnel_port: u16,
    pub verify_relay_tls: bool,
    pub registration_id: Option<String>,
    pub target: SocketAddr,
    pub data_dir: PathBuf,
    pub internal_port: u16,
    pub tunnel_binary: Option<PathBuf>,
    pub log_level: String,
}

pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Merge command-line values over the file, then apply defaults
pub fn resolve(file: ConfigFile, overrides: Overrides) -> Result<RuntimeConfig> {
    let relay_url = overrides
        .relay_url
        .or(file.relay.url)
        .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());
    let parsed = Url::parse(&relay_url).with_context(|| format!("Invalid relay url: {}", relay_url))?;
    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        anyhow::bail!("Relay url must be http(s): {}", relay_url);
    }

    let relay_tunnel_host = match overrides.relay_tunnel_host.or(file.relay.tunnel_host) {
        Some(host) => host,
        None => parsed
            .host_str()
            .map(str::to_string)
            .with_context(|| format!("Relay url has no host: {}", relay_url))?,
    };

    let target = overrides
        .target
        .or(file.server.target)
        .unwrap_or_else(|| DEFAULT_TARGET.to_string());
    let target: SocketAddr = target
        .parse()
        .with_context(|| format!("Invalid target address: {} (expected host:port)", target))?;

    let data_dir = match overrides.data_dir.or(file.server.data_dir) {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("Could not determine a data directory; use --data-dir")?
            .join("cloudlink"),
    };

    Ok(RuntimeConfig {
        relay_url: relay_url.trim_end_matches('/').to_string(),
        relay_tunnel_host,
        relay_tunnel_port: overrides
            .relay_tunnel_port
            .or(file.relay.tunnel_port)
            .unwrap_or(DEFAULT_RELAY_TUNNEL_PORT),
        verify_relay_tls: !(overrides.insecure_relay || file.relay.insecure),
        registration_id: overrides.registration_id.or(file.relay.registration_id),
        target,
        data_dir,
        internal_port: overrides.internal_port.or(file.server.internal_port).unwrap_or(0),
        tunnel_binary: overrides.tunnel_binary.or(file.server.tunnel_binary),
        log_level: overrides
            .log_level
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string()),
    })
}
