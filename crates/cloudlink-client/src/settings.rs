//! Persisted reachability settings
//!
//! Stored as JSON in `<data_dir>/settings.json`. Runtime changes go through
//! `ReachabilityController::update_settings`, which schedules a refresh.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ReachError, Result};

/// How the server is reached from the internet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForwardingMode {
    /// Ask the router for a mapping of a random high port
    #[default]
    #[serde(rename = "UPNP")]
    Upnp,
    /// Operator forwards a port on the router by hand
    #[serde(rename = "Router Forward")]
    RouterForward,
    /// Operator fronts the server with their own domain on 443
    #[serde(rename = "Custom Domain")]
    CustomDomain,
    /// No inbound path; the relay pushes or uses reverse connections
    #[serde(rename = "Disabled")]
    Disabled,
}

impl fmt::Display for ForwardingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Upnp => "UPNP",
            Self::RouterForward => "Router Forward",
            Self::CustomDomain => "Custom Domain",
            Self::Disabled => "Disabled",
        };
        f.write_str(label)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub forwarding_mode: ForwardingMode,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Port of the public TLS listener
    #[serde(default)]
    pub secure_port: Option<u16>,
    /// Public port: the UPnP mapping in UPNP mode, the router forward in
    /// Router Forward mode
    #[serde(default)]
    pub upnp_port: Option<u16>,
    #[serde(default = "default_true")]
    pub tunnel_enabled: bool,
    #[serde(default)]
    pub tunnel_token: Option<String>,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default = "default_true")]
    pub connect_to_relay: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default)]
    pub duckdns_token: Option<String>,
    #[serde(default)]
    pub duckdns_domain: Option<String>,
    /// Bearer token from the first-party OAuth login
    #[serde(default)]
    pub token_info: Option<String>,

    #[serde(default)]
    pub last_persisted_ip: Option<String>,
    #[serde(default)]
    pub last_persisted_upnp_port: Option<u16>,
    #[serde(default)]
    pub last_persisted_registration_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            forwarding_mode: ForwardingMode::default(),
            hostname: None,
            secure_port: None,
            upnp_port: None,
            tunnel_enabled: true,
            tunnel_token: None,
            server_name: None,
            connect_to_relay: true,
            cors_origins: Vec::new(),
            duckdns_token: None,
            duckdns_domain: None,
            token_info: None,
            last_persisted_ip: None,
            last_persisted_upnp_port: None,
            last_persisted_registration_id: None,
        }
    }
}

impl Settings {
    /// Hostname with surrounding whitespace removed, if non-empty
    pub fn hostname(&self) -> Option<&str> {
        non_empty(self.hostname.as_deref())
    }

    pub fn tunnel_token(&self) -> Option<&str> {
        non_empty(self.tunnel_token.as_deref())
    }

    pub fn token_info(&self) -> Option<&str> {
        non_empty(self.token_info.as_deref())
    }

    /// DuckDNS domain and token when both are configured
    pub fn duckdns(&self) -> Option<(&str, &str)> {
        Some((
            non_empty(self.duckdns_domain.as_deref())?,
            non_empty(self.duckdns_token.as_deref())?,
        ))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// JSON file backed settings with an in-memory copy
pub struct SettingsStore {
    path: Option<PathBuf>,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Load settings from `path`, starting from defaults if it does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            let json = fs::read_to_string(&path)?;
            serde_json::from_str(&json).map_err(|e| {
                ReachError::Settings(format!("failed to parse {}: {}", path.display(), e))
            })?
        } else {
            Settings::default()
        };

        Ok(Self {
            path: Some(path),
            current: RwLock::new(settings),
        })
    }

    /// Settings that are never written to disk
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: None,
            current: RwLock::new(settings),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Snapshot of the current settings
    pub async fn get(&self) -> Settings {
        self.current.read().await.clone()
    }

    /// Apply `f`, persist, and return the new settings
    pub async fn update<F>(&self, f: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let mut current = self.current.write().await;
        let mut next = current.clone();
        f(&mut next);

        if next != *current {
            self.persist(&next)?;
            *current = next;
        }
        Ok(current.clone())
    }

    fn persist(&self, settings: &Settings) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        fs::write(path, json)?;
        debug!("Saved settings to {}", path.display());
        Ok(())
    }
}

/// How a settings field is presented for the current mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldVisibility {
    pub hidden: bool,
    pub label: &'static str,
    pub group: &'static str,
}

impl FieldVisibility {
    fn shown(label: &'static str, group: &'static str) -> Self {
        Self {
            hidden: false,
            label,
            group,
        }
    }

    fn hidden_if(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }
}

/// Presentation of every settings field, derived from the mode and values
pub fn visibility(settings: &Settings) -> BTreeMap<&'static str, FieldVisibility> {
    let mode = settings.forwarding_mode;
    let mut fields = BTreeMap::new();

    fields.insert(
        "forwarding_mode",
        FieldVisibility::shown("Forwarding Mode", "Connection"),
    );
    fields.insert(
        "hostname",
        FieldVisibility::shown("Hostname", "Connection")
            .hidden_if(mode != ForwardingMode::CustomDomain),
    );
    fields.insert(
        "secure_port",
        FieldVisibility::shown("Local HTTPS Port", "Connection"),
    );

    let port_label = match mode {
        ForwardingMode::RouterForward => "Forwarded Port",
        _ => "UPNP Port",
    };
    fields.insert(
        "upnp_port",
        FieldVisibility::shown(port_label, "Connection").hidden_if(!matches!(
            mode,
            ForwardingMode::Upnp | ForwardingMode::RouterForward
        )),
    );

    let dns_hidden = !matches!(mode, ForwardingMode::Upnp | ForwardingMode::RouterForward);
    fields.insert(
        "duckdns_domain",
        FieldVisibility::shown("DuckDNS Domain", "DuckDNS").hidden_if(dns_hidden),
    );
    fields.insert(
        "duckdns_token",
        FieldVisibility::shown("DuckDNS Token", "DuckDNS").hidden_if(dns_hidden),
    );

    fields.insert(
        "tunnel_enabled",
        FieldVisibility::shown("Tunnel", "Tunnel"),
    );
    fields.insert(
        "tunnel_token",
        FieldVisibility::shown("Tunnel Token", "Tunnel").hidden_if(!settings.tunnel_enabled),
    );

    fields.insert(
        "server_name",
        FieldVisibility::shown("Server Name", "Advanced"),
    );
    fields.insert(
        "connect_to_relay",
        FieldVisibility::shown("Connect to Cloud", "Advanced"),
    );
    fields.insert(
        "cors_origins",
        FieldVisibility::shown("Additional CORS Origins", "Advanced"),
    );

    fields
}
