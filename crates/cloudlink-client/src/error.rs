//! Reachability error taxonomy

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReachError {
    /// Settings do not describe a usable authority. Abandons the current
    /// refresh; nothing is retried until the settings change.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Tunnel process error: {0}")]
    TunnelProcess(String),

    #[error("Port mapping error: {0}")]
    Mapping(String),

    #[error("Not logged in to the relay")]
    NotLoggedIn,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings error: {0}")]
    Settings(String),
}

impl From<reqwest::Error> for ReachError {
    fn from(e: reqwest::Error) -> Self {
        Self::Relay(e.to_string())
    }
}

impl From<serde_json::Error> for ReachError {
    fn from(e: serde_json::Error) -> Self {
        Self::Settings(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReachError>;
