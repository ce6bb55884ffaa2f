//! Local reverse proxy
//!
//! Two listeners share one request handler: a plain HTTP listener on
//! loopback that carries relay-mediated traffic (reverse connections and
//! multiplexed callback streams), and a TLS listener on all interfaces that
//! is the public front door. Everything not handled locally is forwarded to
//! the internal application over loopback.

pub mod config;
pub mod headers;
pub mod oauth;
pub mod routes;
pub mod server;

pub use config::{AdvertisedAddresses, ListenerKind, ProxyConfig};
pub use oauth::{DeviceCallback, OAuthHandler};
pub use routes::{route, Route, CORE_UI_PATH};
pub use server::{BoundProxy, ProxyServer};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Pick a different secure port in the settings")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Invalid OAuth callback: {0}")]
    OAuth(String),
}
