//! Hostname discovery from tunnel process logs
//!
//! The tunnel reports its ingress configuration as
//! `config="<json string>"`, where the quoted value is itself a JSON string
//! whose contents are the configuration object.

use serde::Deserialize;

#[derive(Deserialize)]
struct TunnelConfig {
    #[serde(default)]
    ingress: Vec<IngressRule>,
}

#[derive(Deserialize)]
struct IngressRule {
    #[serde(default)]
    hostname: Option<String>,
}

const CONFIG_MARKER: &str = "config=";
const QUICK_TUNNEL_SUFFIX: &str = ".trycloudflare.com";

/// First ingress hostname in a config log line, as `https://<hostname>`
pub fn parse_tunnel_log(line: &str) -> Option<String> {
    let start = line.find(CONFIG_MARKER)? + CONFIG_MARKER.len();
    let quoted = &line[start..];

    // Outer layer: a JSON string literal followed by more log fields
    let inner: String = serde_json::Deserializer::from_str(quoted)
        .into_iter::<String>()
        .next()?
        .ok()?;

    let config: TunnelConfig = serde_json::from_str(&inner).ok()?;
    config
        .ingress
        .into_iter()
        .filter_map(|rule| rule.hostname)
        .map(|h| h.trim().to_string())
        .find(|h| !h.is_empty())
        .map(|h| format!("https://{}", h))
}

/// URL a quick tunnel prints once it is reachable
pub fn parse_quick_tunnel_url(line: &str) -> Option<String> {
    line.split(|c: char| c.is_whitespace() || c == '|')
        .find(|token| {
            token.starts_with("https://")
                && token.trim_end_matches('/').ends_with(QUICK_TUNNEL_SUFFIX)
        })
        .map(|token| token.trim_end_matches('/').to_string())
}
