//! Announce the authority to the relay

use cloudlink_proto::RegistrationResponse;
use std::sync::Arc;
use tracing::{info, warn};

use crate::authority::Authority;
use crate::relay::{RelayApi, Registration};
use crate::settings::SettingsStore;
use crate::state::StateHandle;

pub const NOT_LOGGED_IN: &str = "Not logged in. Log in to connect this server to the cloud.";
pub const RELAY_DISABLED: &str = "Cloud connection is disabled in the settings.";

/// Stable identifiers sent with every registration
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub server_id: String,
    pub registration_secret: String,
    pub sender_id: String,
}

pub struct RegistrationClient {
    relay: Arc<dyn RelayApi>,
    settings: Arc<SettingsStore>,
    state: Arc<StateHandle>,
    identity: ServerIdentity,
}

impl RegistrationClient {
    pub fn new(
        relay: Arc<dyn RelayApi>,
        settings: Arc<SettingsStore>,
        state: Arc<StateHandle>,
        identity: ServerIdentity,
    ) -> Self {
        Self {
            relay,
            settings,
            state,
            identity,
        }
    }

    /// Register `authority` under `registration_id`.
    ///
    /// Never fails: being logged out, having the relay disabled, or a relay
    /// error produce a response carrying `error` and raise an alert. A
    /// successful registration becomes the new change-detection baseline.
    pub async fn send_registration_id(
        &self,
        registration_id: &str,
        authority: &Authority,
        force: bool,
    ) -> RegistrationResponse {
        let settings = self.settings.get().await;

        if !settings.connect_to_relay {
            return self.soft_failure(RELAY_DISABLED.to_string());
        }

        let Some(token) = settings.token_info() else {
            return self.soft_failure(NOT_LOGGED_IN.to_string());
        };

        let registration = Registration {
            registration_id: registration_id.to_string(),
            server_id: self.identity.server_id.clone(),
            server_name: settings.server_name.clone(),
            registration_secret: self.identity.registration_secret.clone(),
            sender_id: self.identity.sender_id.clone(),
            authority: authority.clone(),
            force,
        };

        let response = match self.relay.register(&registration, token).await {
            Ok(response) => response,
            Err(e) => return self.soft_failure(format!("Registration failed: {}", e)),
        };

        if let Some(error) = &response.error {
            return self.soft_failure(format!("Registration rejected: {}", error));
        }

        let port = authority.port;
        if let Err(e) = self
            .settings
            .update(|s| {
                s.last_persisted_registration_id = Some(registration_id.to_string());
                s.last_persisted_upnp_port = Some(port);
            })
            .await
        {
            warn!("Could not persist registration baseline: {}", e);
        }

        info!("Registered {} with relay", authority);
        response
    }

    fn soft_failure(&self, error: String) -> RegistrationResponse {
        self.state.raise_alert(error.clone());
        RegistrationResponse {
            ip_address: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::state::LogAlertSink;
    use crate::testing::FakeRelay;

    fn client(settings: Settings, relay: Arc<FakeRelay>) -> (RegistrationClient, Arc<SettingsStore>) {
        let settings = Arc::new(SettingsStore::in_memory(settings));
        let client = RegistrationClient::new(
            relay,
            settings.clone(),
            Arc::new(StateHandle::new(Arc::new(LogAlertSink))),
            ServerIdentity {
                server_id: "srv".to_string(),
                registration_secret: "secret".to_string(),
                sender_id: "sender".to_string(),
            },
        );
        (client, settings)
    }

    fn authority() -> Authority {
        Authority {
            hostname: None,
            port: 45000,
        }
    }

    #[tokio::test]
    async fn test_registration_persists_baseline() {
        let relay = Arc::new(FakeRelay::new("203.0.113.9"));
        let (client, settings) = client(
            Settings {
                token_info: Some("tok".to_string()),
                ..Settings::default()
            },
            relay.clone(),
        );

        let response = client.send_registration_id("reg-1", &authority(), true).await;
        assert_eq!(response.error, None);
        assert_eq!(response.ip_address.as_deref(), Some("203.0.113.9"));

        let (registration, token) = relay.registrations.lock().unwrap()[0].clone();
        assert_eq!(token, "tok");
        assert_eq!(registration.server_id, "srv");
        assert_eq!(registration.registration_secret, "secret");
        assert!(registration.force);

        let stored = settings.get().await;
        assert_eq!(stored.last_persisted_registration_id.as_deref(), Some("reg-1"));
        assert_eq!(stored.last_persisted_upnp_port, Some(45000));
    }

    #[tokio::test]
    async fn test_not_logged_in_is_a_soft_failure() {
        let relay = Arc::new(FakeRelay::new("203.0.113.9"));
        let (client, settings) = client(Settings::default(), relay.clone());

        let response = client.send_registration_id("reg-1", &authority(), false).await;
        assert_eq!(response.error.as_deref(), Some(NOT_LOGGED_IN));
        assert_eq!(relay.registration_count(), 0);
        assert_eq!(client.state.snapshot().alerts, vec![NOT_LOGGED_IN.to_string()]);
        assert_eq!(settings.get().await.last_persisted_upnp_port, None);
    }

    #[tokio::test]
    async fn test_relay_disabled_skips_registration() {
        let relay = Arc::new(FakeRelay::new("203.0.113.9"));
        let (client, _) = client(
            Settings {
                token_info: Some("tok".to_string()),
                connect_to_relay: false,
                ..Settings::default()
            },
            relay.clone(),
        );

        let response = client.send_registration_id("reg-1", &authority(), false).await;
        assert_eq!(response.error.as_deref(), Some(RELAY_DISABLED));
        assert_eq!(relay.registration_count(), 0);
    }

    #[tokio::test]
    async fn test_rejection_keeps_old_baseline() {
        let relay = Arc::new(FakeRelay::new("203.0.113.9"));
        *relay.register_response.lock().unwrap() = RegistrationResponse {
            ip_address: None,
            error: Some("bad secret".to_string()),
        };
        let (client, settings) = client(
            Settings {
                token_info: Some("tok".to_string()),
                last_persisted_upnp_port: Some(41000),
                ..Settings::default()
            },
            relay,
        );

        let response = client.send_registration_id("reg-1", &authority(), false).await;
        assert_eq!(
            response.error.as_deref(),
            Some("Registration rejected: bad secret")
        );
        assert_eq!(settings.get().await.last_persisted_upnp_port, Some(41000));
    }
}
