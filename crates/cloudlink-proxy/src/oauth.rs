//! OAuth redirect landing
//!
//! Two flows arrive at the same path. A first-party login carries
//! `token_info` and completes the server's own relay login. A device flow
//! carries `callback_url`, whose `state` parameter is a JSON object
//! `{ "s": <original state>, "d": <device id>, "r": <redirect> }` packed by
//! the device when it started the flow.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::ProxyError;

/// Hooks the proxy calls when an OAuth redirect lands
#[async_trait]
pub trait OAuthHandler: Send + Sync {
    /// Persist a first-party login token and force a relay registration
    async fn complete_login(&self, token_info: &str) -> Result<(), String>;

    /// Hand the restored callback url to the device that started the flow
    async fn device_callback(&self, device_id: &str, callback_url: &str) -> Result<(), String>;
}

/// What the query of an OAuth callback asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackRequest {
    Login { token_info: String },
    Device(DeviceCallback),
}

/// A device OAuth callback with its state unpacked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCallback {
    pub device_id: String,
    /// Callback url with `state` restored to the device's original value
    pub callback_url: String,
    /// Where to send the browser afterwards
    pub redirect: String,
}

#[derive(Deserialize)]
struct PackedState {
    s: String,
    d: String,
    r: String,
}

/// Parse the query string of a `/web/oauth/callback` request
pub fn parse_callback_query(query: &str) -> Result<CallbackRequest, ProxyError> {
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let param = |name: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .filter(|v| !v.is_empty())
    };

    if let Some(token_info) = param("token_info") {
        return Ok(CallbackRequest::Login { token_info });
    }

    let callback_url =
        param("callback_url").ok_or_else(|| ProxyError::OAuth("missing callback_url".into()))?;
    resolve_device_callback(&callback_url).map(CallbackRequest::Device)
}

/// Unpack the device state embedded in a callback url
pub fn resolve_device_callback(callback_url: &str) -> Result<DeviceCallback, ProxyError> {
    let mut url = Url::parse(callback_url)
        .map_err(|e| ProxyError::OAuth(format!("callback_url: {}", e)))?;

    let state = url
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| ProxyError::OAuth("callback_url has no state".into()))?;

    let packed: PackedState = serde_json::from_str(&state)
        .map_err(|e| ProxyError::OAuth(format!("state is not a packed device state: {}", e)))?;

    let rest: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "state")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (k, v) in &rest {
            query.append_pair(k, v);
        }
        query.append_pair("state", &packed.s);
    }

    Ok(DeviceCallback {
        device_id: packed.d,
        callback_url: url.to_string(),
        redirect: packed.r,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &str) -> String {
        url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
    }

    #[test]
    fn test_first_party_login() {
        let request = parse_callback_query("token_info=abc123").unwrap();
        assert_eq!(
            request,
            CallbackRequest::Login {
                token_info: "abc123".to_string()
            }
        );
    }

    #[test]
    fn test_device_callback_restores_state() {
        let state = r#"{"s":"orig-state","d":"17","r":"/endpoint/nest/public/"}"#;
        let callback = format!(
            "https://cam.example.com/oauth?code=xyz&state={}",
            encode(state)
        );
        let query = format!("callback_url={}", encode(&callback));

        let CallbackRequest::Device(device) = parse_callback_query(&query).unwrap() else {
            panic!("expected device callback");
        };

        assert_eq!(device.device_id, "17");
        assert_eq!(device.redirect, "/endpoint/nest/public/");

        let restored = Url::parse(&device.callback_url).unwrap();
        let params: Vec<_> = restored.query_pairs().into_owned().collect();
        assert!(params.contains(&("code".to_string(), "xyz".to_string())));
        assert!(params.contains(&("state".to_string(), "orig-state".to_string())));
    }

    #[test]
    fn test_missing_parameters_rejected() {
        assert!(parse_callback_query("foo=bar").is_err());
    }

    #[test]
    fn test_unpacked_state_rejected() {
        let callback = "https://cam.example.com/oauth?code=xyz&state=plain";
        assert!(resolve_device_callback(callback).is_err());
    }
}
