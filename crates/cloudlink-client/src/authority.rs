//! Advertised authority per forwarding mode

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

use crate::error::{ReachError, Result};
use crate::settings::{ForwardingMode, Settings};

/// Range random UPnP ports are drawn from
pub const UPNP_PORT_RANGE: Range<u16> = 40000..60000;

/// Secure listener port when none is configured
pub const DEFAULT_SECURE_PORT: u16 = 10443;

/// Reserved for domain-fronted traffic
pub const HTTPS_PORT: u16 = 443;

/// Public address advertised to the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Authority {
    pub hostname: Option<String>,
    pub port: u16,
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hostname {
            Some(host) => write!(f, "{}:{}", host, self.port),
            None => write!(f, "*:{}", self.port),
        }
    }
}

pub fn random_upnp_port<R: Rng + ?Sized>(rng: &mut R) -> u16 {
    rng.gen_range(UPNP_PORT_RANGE)
}

/// Port the TLS listener binds. In UPNP mode without an explicit secure
/// port the mapping is one-to-one, so the listener uses the UPnP port.
pub fn effective_secure_port(settings: &Settings) -> u16 {
    match (settings.secure_port, settings.forwarding_mode, settings.upnp_port) {
        (Some(port), _, _) => port,
        (None, ForwardingMode::Upnp, Some(upnp)) => upnp,
        _ => DEFAULT_SECURE_PORT,
    }
}

/// Compute the authority for the configured mode.
///
/// UPNP mode expects the UPnP port to have been chosen already.
pub fn compute_authority(settings: &Settings) -> Result<Authority> {
    let secure_port = effective_secure_port(settings);

    let authority = match settings.forwarding_mode {
        ForwardingMode::Disabled => Authority {
            hostname: None,
            port: secure_port,
        },
        ForwardingMode::RouterForward => Authority {
            hostname: None,
            port: settings.upnp_port.unwrap_or(secure_port),
        },
        ForwardingMode::CustomDomain => {
            let hostname = settings.hostname().ok_or_else(|| {
                ReachError::Configuration(
                    "Custom Domain mode requires a hostname".to_string(),
                )
            })?;
            Authority {
                hostname: Some(hostname.to_string()),
                port: HTTPS_PORT,
            }
        }
        ForwardingMode::Upnp => {
            let port = settings.upnp_port.ok_or_else(|| {
                ReachError::Configuration("UPnP port has not been chosen".to_string())
            })?;
            Authority {
                hostname: None,
                port,
            }
        }
    };

    validate(&authority)?;
    Ok(authority)
}

/// Port 443 is only valid with a hostname
pub fn validate(authority: &Authority) -> Result<()> {
    if authority.port == HTTPS_PORT && authority.hostname.is_none() {
        return Err(ReachError::Configuration(
            "Port 443 is reserved for custom domains. Configure a hostname or choose another port."
                .to_string(),
        ));
    }
    Ok(())
}
