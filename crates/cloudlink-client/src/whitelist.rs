//! Signed public URLs for local paths
//!
//! The relay signs a path for a lifetime; the signature travels as query
//! parameters on the public URL. Signed URLs are cached per (origin, path)
//! until they expire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ReachError, Result};
use crate::relay::RelayApi;
use crate::settings::{ForwardingMode, SettingsStore};
use crate::state::StateHandle;

/// Lifetime of durable URLs (10 years)
pub const DURABLE_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Lifetime of URLs served through a quick tunnel
pub const SHORT_LIVED_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlLifetime {
    Durable,
    /// Prefer the tunnel hostname when one is running
    ShortLived,
}

struct CachedUrl {
    url: String,
    expires: Instant,
}

pub struct PublicUrlConverter {
    relay: Arc<dyn RelayApi>,
    settings: Arc<SettingsStore>,
    state: Arc<StateHandle>,
    relay_origin: String,
    cache: Mutex<HashMap<(String, String), CachedUrl>>,
}

impl PublicUrlConverter {
    pub fn new(
        relay: Arc<dyn RelayApi>,
        settings: Arc<SettingsStore>,
        state: Arc<StateHandle>,
        relay_origin: impl Into<String>,
    ) -> Self {
        Self {
            relay,
            settings,
            state,
            relay_origin: relay_origin.into().trim_end_matches('/').to_string(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Convert `local_path` (e.g. `/endpoint/42/public/snapshot.jpg`) into a
    /// signed public URL
    pub async fn convert(&self, local_path: &str, lifetime: UrlLifetime) -> Result<String> {
        let settings = self.settings.get().await;
        let token = settings.token_info().ok_or(ReachError::NotLoggedIn)?;

        let tunnel = self.state.snapshot().tunnel_hostname;
        let (origin, ttl) = match (lifetime, tunnel) {
            (UrlLifetime::ShortLived, Some(tunnel)) => (tunnel, SHORT_LIVED_TTL),
            _ => {
                let origin = match (settings.forwarding_mode, settings.hostname()) {
                    (ForwardingMode::CustomDomain, Some(host)) => format!("https://{}", host),
                    _ => self.relay_origin.clone(),
                };
                (origin, DURABLE_TTL)
            }
        };

        let key = (origin.clone(), local_path.to_string());
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(&key) {
            if Instant::now() < cached.expires {
                return Ok(cached.url.clone());
            }
        }

        let scope = self.relay.scope(local_path, ttl, token).await?;
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("user_token", &scope.user_token)
            .append_pair("user_token_signature", &scope.user_token_signature)
            .finish();
        let url = format!("{}{}?{}", origin, local_path, query);

        debug!("Signed {} for {:?}", local_path, ttl);
        cache.insert(
            key,
            CachedUrl {
                url: url.clone(),
                expires: Instant::now() + ttl,
            },
        );
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::state::LogAlertSink;
    use crate::testing::FakeRelay;

    fn converter(settings: Settings) -> (PublicUrlConverter, Arc<FakeRelay>, Arc<StateHandle>) {
        let relay = Arc::new(FakeRelay::new("203.0.113.9"));
        let state = Arc::new(StateHandle::new(Arc::new(LogAlertSink)));
        let converter = PublicUrlConverter::new(
            relay.clone(),
            Arc::new(SettingsStore::in_memory(settings)),
            state.clone(),
            "https://relay.example.com/",
        );
        (converter, relay, state)
    }

    fn logged_in() -> Settings {
        Settings {
            token_info: Some("tok".to_string()),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_requires_login() {
        let (converter, _, _) = converter(Settings::default());
        assert!(matches!(
            converter.convert("/endpoint/1/public/a", UrlLifetime::Durable).await,
            Err(ReachError::NotLoggedIn)
        ));
    }

    #[tokio::test]
    async fn test_cached_url_is_reused() {
        let (converter, relay, _) = converter(logged_in());

        let first = converter
            .convert("/endpoint/1/public/a", UrlLifetime::Durable)
            .await
            .unwrap();
        let second = converter
            .convert("/endpoint/1/public/a", UrlLifetime::Durable)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first,
            "https://relay.example.com/endpoint/1/public/a?user_token=user-1&user_token_signature=sig-1"
        );
        assert_eq!(relay.scopes.lock().unwrap().len(), 1);
        assert_eq!(relay.scopes.lock().unwrap()[0].1, DURABLE_TTL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_lived_url_uses_tunnel_and_expires() {
        let (converter, relay, state) = converter(logged_in());
        state.set_tunnel_hostname(Some("https://quick.trycloudflare.com".to_string()));

        let first = converter
            .convert("/endpoint/1/public/a", UrlLifetime::ShortLived)
            .await
            .unwrap();
        assert!(first.starts_with("https://quick.trycloudflare.com/endpoint/1/public/a?"));

        tokio::time::advance(SHORT_LIVED_TTL + Duration::from_secs(1)).await;
        let second = converter
            .convert("/endpoint/1/public/a", UrlLifetime::ShortLived)
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(relay.scopes.lock().unwrap().len(), 2);
        assert_eq!(relay.scopes.lock().unwrap()[1].1, SHORT_LIVED_TTL);
    }

    #[tokio::test]
    async fn test_short_lived_without_tunnel_is_durable() {
        let (converter, relay, _) = converter(logged_in());
        converter
            .convert("/endpoint/1/public/a", UrlLifetime::ShortLived)
            .await
            .unwrap();
        assert_eq!(relay.scopes.lock().unwrap()[0].1, DURABLE_TTL);
    }

    #[tokio::test]
    async fn test_custom_domain_origin() {
        let (converter, _, _) = converter(Settings {
            forwarding_mode: ForwardingMode::CustomDomain,
            hostname: Some("cam.example.com".to_string()),
            ..logged_in()
        });
        let url = converter
            .convert("/endpoint/1/public/a", UrlLifetime::Durable)
            .await
            .unwrap();
        assert!(url.starts_with("https://cam.example.com/endpoint/1/public/a?"));
    }
}
