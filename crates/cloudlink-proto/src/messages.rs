//! Relay push messages and REST payloads

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayMessageError {
    #[error("Malformed relay message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid callback address: {0}")]
    InvalidAddress(String),

    #[error("Push request is not addressed to /push/<deviceId>: {0}")]
    NotAPushPath(String),
}

/// Message delivered by the relay through the push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayMessage {
    /// The relay wants an inbound connection and names the edge to dial
    #[serde(rename = "callback")]
    Callback { address: String },

    /// An HTTP request the relay received for one of our devices
    #[serde(rename = "cloudmessage")]
    CloudMessage { request: CloudRequest },
}

impl RelayMessage {
    pub fn from_json(json: &str) -> Result<Self, RelayMessageError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Split a `host:port` callback address
pub fn parse_callback_address(address: &str) -> Result<(String, u16), RelayMessageError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| RelayMessageError::InvalidAddress(address.to_string()))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(RelayMessageError::InvalidAddress(address.to_string()));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| RelayMessageError::InvalidAddress(address.to_string()))?;

    Ok((host.to_string(), port))
}

/// HTTP-request-shaped payload of a `cloudmessage`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl CloudRequest {
    /// Path portion of the request url, which may be absolute or relative
    pub fn path(&self) -> &str {
        let without_scheme = match self.url.find("://") {
            Some(idx) => {
                let rest = &self.url[idx + 3..];
                rest.find('/').map(|p| &rest[p..]).unwrap_or("/")
            }
            None => self.url.as_str(),
        };
        without_scheme.split(['?', '#']).next().unwrap_or("/")
    }

    /// Device the push is addressed to (`/push/<deviceId>[/...]`)
    pub fn device_id(&self) -> Result<&str, RelayMessageError> {
        let path = self.path();
        path.strip_prefix("/push/")
            .and_then(|rest| rest.split('/').next())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RelayMessageError::NotAPushPath(path.to_string()))
    }
}

/// `GET /_punch/ip`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpResponse {
    pub ip: String,
}

/// `GET /_punch/register`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /_punch/scope`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeResponse {
    pub user_token: String,
    pub user_token_signature: String,
}
