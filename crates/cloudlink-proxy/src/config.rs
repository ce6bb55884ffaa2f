//! Proxy configuration

use std::net::SocketAddr;

/// Listener addresses and the internal application the proxy fronts
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Plain HTTP listener for relay-mediated traffic (loopback only)
    pub internal_addr: SocketAddr,

    /// TLS listener, normally `0.0.0.0:<secure port>`
    pub secure_addr: SocketAddr,

    /// Internal application HTTP endpoint
    pub target: SocketAddr,
}

impl ProxyConfig {
    pub fn new(secure_port: u16, target: SocketAddr) -> Self {
        Self {
            internal_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            secure_addr: SocketAddr::from(([0, 0, 0, 0], secure_port)),
            target,
        }
    }
}

/// Addresses stamped onto responses. Updated whenever the reachability
/// state changes, read by every request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisedAddresses {
    /// Hostname the operator configured for the public listener
    pub public_hostname: Option<String>,

    /// `https://host:port` reachable without the relay, if any
    pub direct_address: Option<String>,

    /// `https://host` served by the relay or the tunnel
    pub cloud_address: Option<String>,

    /// Extra origins allowed to make credentialed requests
    pub cors_origins: Vec<String>,
}

/// Which listener accepted a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Internal,
    Secure,
}
