//! Relay REST client
//!
//! Every HTTP call the reachability code makes leaves through [`RelayApi`],
//! including the DNS-update provider, so tests substitute one fake.

use async_trait::async_trait;
use cloudlink_proto::{IpResponse, RegistrationResponse, ScopeResponse};
use std::time::Duration;
use tracing::debug;

use crate::authority::Authority;
use crate::error::{ReachError, Result};

/// Push sender the relay expects registrations to name
pub const DEFAULT_SENDER_ID: &str = "827888101440";

/// Upper bound for IP resolution and the port-forward self-test
pub const RELAY_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

const DUCKDNS_UPDATE_URL: &str = "https://www.duckdns.org/update";

/// Payload of `/_punch/register`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub registration_id: String,
    pub server_id: String,
    pub server_name: Option<String>,
    pub registration_secret: String,
    pub sender_id: String,
    pub authority: Authority,
    pub force: bool,
}

impl Registration {
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("upnp_port", self.authority.port.to_string()),
            ("registration_id", self.registration_id.clone()),
            ("sender_id", self.sender_id.clone()),
            ("registration_secret", self.registration_secret.clone()),
            ("server_id", self.server_id.clone()),
        ];
        if let Some(name) = &self.server_name {
            query.push(("server_name", name.clone()));
        }
        if let Some(hostname) = &self.authority.hostname {
            query.push(("hostname", hostname.clone()));
        }
        if self.force {
            query.push(("force", "true".to_string()));
        }
        query
    }
}

#[async_trait]
pub trait RelayApi: Send + Sync {
    /// `GET /_punch/ip`: the address this request arrived from
    async fn resolve_ip(&self) -> Result<String>;

    /// `GET /_punch/register`
    async fn register(&self, registration: &Registration, token: &str)
        -> Result<RegistrationResponse>;

    /// `GET /_punch/scope`: sign `path` for `ttl`
    async fn scope(&self, path: &str, ttl: Duration, token: &str) -> Result<ScopeResponse>;

    /// `GET /_punch/curl`: have the relay fetch `url` and return the body
    async fn curl(&self, url: &str, token: Option<&str>) -> Result<String>;

    /// Update a DuckDNS record to the caller's address and return it
    async fn update_duckdns(&self, domain: &str, token: &str) -> Result<String>;
}

/// [`RelayApi`] over HTTPS
pub struct HttpRelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRelayClient {
    /// `base_url` is the relay origin, e.g. `https://relay.example.com`
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("cloudlink/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// OAuth entry point the operator opens in a browser to log in
    pub fn login_url(&self, redirect_uri: &str) -> String {
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("redirect_uri", redirect_uri)
            .finish();
        format!("{}/_punch/login?{}", self.base_url, query)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl RelayApi for HttpRelayClient {
    async fn resolve_ip(&self) -> Result<String> {
        let response: IpResponse = self
            .http
            .get(self.endpoint("/_punch/ip"))
            .timeout(RELAY_CHECK_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.ip)
    }

    async fn register(
        &self,
        registration: &Registration,
        token: &str,
    ) -> Result<RegistrationResponse> {
        debug!(
            "Registering {} with relay (force={})",
            registration.authority, registration.force
        );
        let response = self
            .http
            .get(self.endpoint("/_punch/register"))
            .query(&registration.query())
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }

    async fn scope(&self, path: &str, ttl: Duration, token: &str) -> Result<ScopeResponse> {
        let ttl_ms = ttl.as_millis().to_string();
        let response = self
            .http
            .get(self.endpoint("/_punch/scope"))
            .query(&[("scope", path), ("ttl", ttl_ms.as_str())])
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }

    async fn curl(&self, url: &str, token: Option<&str>) -> Result<String> {
        let mut request = self
            .http
            .get(self.endpoint("/_punch/curl"))
            .query(&[("url", url)])
            .timeout(RELAY_CHECK_TIMEOUT);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?.error_for_status()?.text().await?)
    }

    async fn update_duckdns(&self, domain: &str, token: &str) -> Result<String> {
        let body = self
            .http
            .get(DUCKDNS_UPDATE_URL)
            .query(&[("domains", domain), ("token", token), ("verbose", "true")])
            .timeout(RELAY_CHECK_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_duckdns_response(&body)
    }
}

/// Verbose DuckDNS replies are `OK\n<ipv4>\n<ipv6>\n<UPDATED|NOCHANGE>`
pub fn parse_duckdns_response(body: &str) -> Result<String> {
    let mut lines = body.lines().map(str::trim);
    match (lines.next(), lines.next()) {
        (Some("OK"), Some(ip)) if !ip.is_empty() => Ok(ip.to_string()),
        _ => Err(ReachError::Relay(format!(
            "DuckDNS update failed: {}",
            body.lines().next().unwrap_or("empty response")
        ))),
    }
}
