use async_trait::async_trait;
use cloudlink_client::controller::STATUS_VERIFIED;
use cloudlink_client::portmap::{PortMapper, PortMapping};
use cloudlink_client::relay::{RelayApi, Registration};
use cloudlink_client::{
    Authority, ForwardingMode, LogAlertSink, ReachabilityController, Result, ServerIdentity,
    Settings, SettingsStore, StateHandle, UnhandledDevices,
};
use cloudlink_proto::{RegistrationResponse, ScopeResponse};
use cloudlink_proxy::{OAuthHandler, ProxyConfig, ProxyServer};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Relay whose `/_punch/curl` fetches the path from the local proxy's
/// internal listener, standing in for a fetch through the public authority
struct LoopbackRelay {
    proxy: Mutex<Option<SocketAddr>>,
    registrations: Mutex<Vec<Registration>>,
    requested_urls: Mutex<Vec<String>>,
}

impl LoopbackRelay {
    fn new() -> Self {
        Self {
            proxy: Mutex::new(None),
            registrations: Mutex::new(Vec::new()),
            requested_urls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RelayApi for LoopbackRelay {
    async fn resolve_ip(&self) -> Result<String> {
        Ok("203.0.113.9".to_string())
    }

    async fn register(
        &self,
        registration: &Registration,
        _token: &str,
    ) -> Result<RegistrationResponse> {
        self.registrations.lock().unwrap().push(registration.clone());
        Ok(RegistrationResponse {
            ip_address: Some("203.0.113.9".to_string()),
            error: None,
        })
    }

    async fn scope(&self, _path: &str, _ttl: Duration, _token: &str) -> Result<ScopeResponse> {
        Ok(ScopeResponse {
            user_token: "u".to_string(),
            user_token_signature: "s".to_string(),
        })
    }

    async fn curl(&self, url: &str, _token: Option<&str>) -> Result<String> {
        self.requested_urls.lock().unwrap().push(url.to_string());
        let proxy = self.proxy.lock().unwrap().expect("proxy started");
        let path = url::Url::parse(url).unwrap().path().to_string();
        let body = reqwest::get(format!("http://{}{}", proxy, path))
            .await?
            .text()
            .await?;
        Ok(body)
    }

    async fn update_duckdns(&self, _domain: &str, _token: &str) -> Result<String> {
        Ok("203.0.113.9".to_string())
    }
}

#[derive(Default)]
struct RecordingMapper {
    mappings: Mutex<Vec<PortMapping>>,
}

#[async_trait]
impl PortMapper for RecordingMapper {
    async fn map_port(&self, mapping: &PortMapping) -> Result<()> {
        self.mappings.lock().unwrap().push(mapping.clone());
        Ok(())
    }
}

fn controller(
    settings: Settings,
    relay: Arc<LoopbackRelay>,
    mapper: Arc<RecordingMapper>,
) -> Arc<ReachabilityController> {
    Arc::new(ReachabilityController::new(
        Arc::new(SettingsStore::in_memory(settings)),
        Arc::new(StateHandle::new(Arc::new(LogAlertSink))),
        relay,
        mapper,
        Arc::new(UnhandledDevices),
        ServerIdentity {
            server_id: "srv".to_string(),
            registration_secret: "secret".to_string(),
            sender_id: "sender".to_string(),
        },
        "https://relay.example.com",
    ))
}

/// Bind the proxy for `controller` and point the relay's fetches at it
async fn start_proxy(controller: &Arc<ReachabilityController>, relay: &LoopbackRelay) -> SocketAddr {
    let cert = cloudlink_cert::generate_self_signed_cert(&[]).unwrap();
    let tls = cloudlink_cert::load_certificate(&cert.pem_cert, &cert.pem_key)
        .unwrap()
        .server_config()
        .unwrap();
    let mut config = ProxyConfig::new(0, "127.0.0.1:9".parse().unwrap());
    config.secure_addr = "127.0.0.1:0".parse().unwrap();
    let oauth: Arc<dyn OAuthHandler> = controller.clone();
    let proxy = ProxyServer::new(config, tls, oauth, controller.addresses())
        .bind()
        .await
        .unwrap();

    controller.set_test_token(proxy.test_token());
    let internal = proxy.internal_addr();
    *relay.proxy.lock().unwrap() = Some(internal);
    tokio::spawn(proxy.run());
    internal
}

#[tokio::test]
async fn test_custom_domain_self_test_round_trips_proxy_token() {
    let relay = Arc::new(LoopbackRelay::new());
    let controller = controller(
        Settings {
            forwarding_mode: ForwardingMode::CustomDomain,
            hostname: Some("cam.example.com".to_string()),
            ..Settings::default()
        },
        relay.clone(),
        Arc::new(RecordingMapper::default()),
    );

    assert_eq!(
        controller.get_authority().await.unwrap(),
        Authority {
            hostname: Some("cam.example.com".to_string()),
            port: 443
        }
    );

    start_proxy(&controller, &relay).await;

    controller.test_port_forward().await.unwrap();

    assert_eq!(controller.state().snapshot().status, STATUS_VERIFIED);
    assert_eq!(
        relay.requested_urls.lock().unwrap().as_slice(),
        &["https://cam.example.com:443/web/testPortForward".to_string()]
    );
}

#[tokio::test]
async fn test_upnp_refresh_maps_and_registers_once() {
    let relay = Arc::new(LoopbackRelay::new());
    let mapper = Arc::new(RecordingMapper::default());
    let controller = controller(
        Settings {
            forwarding_mode: ForwardingMode::Upnp,
            token_info: Some("tok".to_string()),
            ..Settings::default()
        },
        relay.clone(),
        mapper.clone(),
    );
    controller.set_registration_id("reg-1".to_string());

    controller.refresh_port_forward(false).await.unwrap();
    controller.refresh_port_forward(false).await.unwrap();

    let port = controller.settings().get().await.upnp_port.unwrap();
    assert!((40000..60000).contains(&port));

    let mappings = mapper.mappings.lock().unwrap().clone();
    assert_eq!(mappings.len(), 2);
    assert!(mappings
        .iter()
        .all(|m| m.public_port == port && m.private_port == port));

    let registrations = relay.registrations.lock().unwrap().clone();
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].authority.port, port);
    assert_eq!(registrations[0].registration_id, "reg-1");
}

#[tokio::test]
async fn test_login_through_proxy_callback_persists_token() {
    let relay = Arc::new(LoopbackRelay::new());
    let controller = controller(
        Settings::default(),
        relay.clone(),
        Arc::new(RecordingMapper::default()),
    );
    let internal = start_proxy(&controller, &relay).await;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let response = client
        .get(format!("http://{}/web/oauth/callback?token_info=token-abc", internal))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 302);

    assert_eq!(
        controller.settings().get().await.token_info.as_deref(),
        Some("token-abc")
    );
}
