//! Reachability controller
//!
//! Decides how the server is reached, keeps the UPnP mapping alive and
//! announces the authority to the relay. Refreshes are requested through
//! [`ReachabilityController::schedule_refresh_port_forward`], coalesced for
//! one second, and also run every 30 minutes.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use cloudlink_proxy::{AdvertisedAddresses, OAuthHandler};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::authority::{
    compute_authority, effective_secure_port, random_upnp_port, Authority, HTTPS_PORT,
};
use crate::dispatch::DeviceHandlers;
use crate::error::{ReachError, Result};
use crate::portmap::{PortMapper, PortMapping, MAPPING_TTL};
use crate::registration::{RegistrationClient, ServerIdentity};
use crate::relay::{RelayApi, RELAY_CHECK_TIMEOUT};
use crate::settings::{ForwardingMode, Settings, SettingsStore};
use crate::shutdown::ShutdownSignal;
use crate::state::StateHandle;

/// Window in which refresh requests collapse into one
pub const REFRESH_DEBOUNCE: Duration = Duration::from_secs(1);

/// Unconditional refresh period, well inside the UPnP lease
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub const STATUS_VERIFIED: &str = "Port forward verified";

/// The relay reports this instead of an address when it cannot tell
const RELAY_LOCALHOST: &str = "localhost";

const MAPPING_DESCRIPTION: &str = "cloudlink";

pub struct ReachabilityController {
    settings: Arc<SettingsStore>,
    state: Arc<StateHandle>,
    relay: Arc<dyn RelayApi>,
    mapper: Arc<dyn PortMapper>,
    devices: Arc<dyn DeviceHandlers>,
    registration: RegistrationClient,
    relay_origin: String,
    addresses: watch::Sender<AdvertisedAddresses>,
    registration_id: watch::Sender<Option<String>>,
    test_token: OnceLock<String>,
    listening_port: OnceLock<u16>,
    refresh_tx: mpsc::UnboundedSender<bool>,
    refresh_rx: Mutex<mpsc::UnboundedReceiver<bool>>,
    cycle: Mutex<()>,
}

impl ReachabilityController {
    pub fn new(
        settings: Arc<SettingsStore>,
        state: Arc<StateHandle>,
        relay: Arc<dyn RelayApi>,
        mapper: Arc<dyn PortMapper>,
        devices: Arc<dyn DeviceHandlers>,
        identity: ServerIdentity,
        relay_origin: impl Into<String>,
    ) -> Self {
        let registration =
            RegistrationClient::new(relay.clone(), settings.clone(), state.clone(), identity);
        let (addresses, _) = watch::channel(AdvertisedAddresses::default());
        let (registration_id, _) = watch::channel(None);
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();

        Self {
            settings,
            state,
            relay,
            mapper,
            devices,
            registration,
            relay_origin: relay_origin.into().trim_end_matches('/').to_string(),
            addresses,
            registration_id,
            test_token: OnceLock::new(),
            listening_port: OnceLock::new(),
            refresh_tx,
            refresh_rx: Mutex::new(refresh_rx),
            cycle: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn state(&self) -> &Arc<StateHandle> {
        &self.state
    }

    /// Addresses the proxy stamps onto responses
    pub fn addresses(&self) -> watch::Receiver<AdvertisedAddresses> {
        self.addresses.subscribe()
    }

    /// Token served by the proxy's `/testPortForward`. Set once.
    pub fn set_test_token(&self, token: impl Into<String>) {
        if self.test_token.set(token.into()).is_err() {
            debug!("Port forward test token already set");
        }
    }

    /// Port the TLS listener bound. Mappings keep targeting it after the
    /// configured port changes. Set once.
    pub fn set_listening_port(&self, port: u16) {
        if self.listening_port.set(port).is_err() {
            debug!("Listening port already set");
        }
    }

    /// Persist a settings change and schedule a debounced refresh
    pub async fn update_settings<F>(&self, f: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let settings = self.settings.update(f).await?;
        self.schedule_refresh_port_forward(false);
        Ok(settings)
    }

    pub fn registration_id(&self) -> Option<String> {
        self.registration_id.borrow().clone()
    }

    /// A new push registration id forces re-registration
    pub fn set_registration_id(&self, id: String) {
        self.registration_id.send_replace(Some(id));
        self.schedule_refresh_port_forward(true);
    }

    /// Current authority. In UPNP mode a random port is chosen and
    /// persisted the first time.
    pub async fn get_authority(&self) -> Result<Authority> {
        let mut settings = self.settings.get().await;

        if settings.forwarding_mode == ForwardingMode::Upnp && settings.upnp_port.is_none() {
            let port = random_upnp_port(&mut rand::thread_rng());
            settings = self
                .settings
                .update(|s| {
                    if s.upnp_port.is_none() {
                        s.upnp_port = Some(port);
                    }
                })
                .await?;
            info!("Chose UPnP port {}", settings.upnp_port.unwrap_or(port));
        }

        compute_authority(&settings)
    }

    /// Request a refresh. Requests within [`REFRESH_DEBOUNCE`] collapse into
    /// one; the merged refresh is forced if any request was.
    pub fn schedule_refresh_port_forward(&self, force: bool) {
        let _ = self.refresh_tx.send(force);
    }

    /// Recompute the authority, renew the UPnP mapping and re-register.
    ///
    /// Only configuration errors are returned; everything else is reported
    /// through status and alerts.
    pub async fn refresh_port_forward(&self, force: bool) -> Result<()> {
        let _cycle = self.cycle.lock().await;
        self.state.clear_alerts();

        let authority = match self.get_authority().await {
            Ok(authority) => authority,
            Err(e) => {
                let message = e.to_string();
                self.state.set_status(message.clone());
                self.state.set_authority(None);
                self.state.raise_alert(message);
                return Err(e);
            }
        };
        self.state.set_authority(Some(authority.clone()));

        let settings = self.settings.get().await;
        let configured = effective_secure_port(&settings);
        let listening = self.listening_port.get().copied().unwrap_or(configured);
        if listening != configured
            && matches!(
                settings.forwarding_mode,
                ForwardingMode::RouterForward | ForwardingMode::CustomDomain
            )
        {
            self.state.raise_alert(format!(
                "The secure port changed to {}. Restart the server to listen on it; \
                 it is still listening on {}.",
                configured, listening
            ));
        }

        let mut mapping_failed = false;
        if settings.forwarding_mode == ForwardingMode::Upnp {
            let mapping = PortMapping {
                public_port: authority.port,
                private_host: None,
                private_port: listening,
                ttl: MAPPING_TTL,
                description: MAPPING_DESCRIPTION.to_string(),
            };
            if let Err(e) = self.mapper.map_port(&mapping).await {
                let message = format!("UPnP port mapping failed: {}", e);
                self.state.set_status(message.clone());
                self.state.raise_alert(message);
                mapping_failed = true;
            }
        }

        self.update_port_forward(&settings, &authority, force, mapping_failed)
            .await;
        Ok(())
    }

    async fn update_port_forward(
        &self,
        settings: &Settings,
        authority: &Authority,
        force: bool,
        keep_status: bool,
    ) {
        let Some(registration_id) = self.registration_id() else {
            debug!("No push registration id yet; skipping relay registration");
            self.publish_addresses(settings, authority, None);
            return;
        };

        let ip = match self.resolve_ip(settings, authority).await {
            Ok(ip) => ip,
            Err(e) => {
                self.state
                    .raise_alert(format!("Could not determine the public IP address: {}", e));
                self.publish_addresses(settings, authority, None);
                return;
            }
        };

        let unchanged = settings.last_persisted_ip.as_deref() == Some(ip.as_str())
            && settings.last_persisted_upnp_port == Some(authority.port);
        if unchanged && !force {
            debug!("Authority {} at {} unchanged; not re-registering", authority, ip);
            self.state.set_public_ip(Some(ip.clone()));
            self.publish_addresses(settings, authority, Some(&ip));
            return;
        }

        let response = self
            .registration
            .send_registration_id(&registration_id, authority, force)
            .await;
        if let Some(error) = response.error {
            if !keep_status {
                self.state.set_status(format!("Not registered: {}", error));
            }
            self.publish_addresses(settings, authority, Some(&ip));
            return;
        }

        let trusted_hostname = authority.hostname.as_deref() == Some(ip.as_str());
        if let Some(reported) = response.ip_address.as_deref() {
            if !trusted_hostname && reported != RELAY_LOCALHOST && reported != ip {
                self.state.raise_alert(format!(
                    "The public IP address {} does not match the address the cloud sees ({}). \
                     Check the hostname or DNS settings.",
                    ip, reported
                ));
            }
        }

        let persisted = ip.clone();
        if let Err(e) = self
            .settings
            .update(|s| s.last_persisted_ip = Some(persisted))
            .await
        {
            warn!("Could not persist public IP: {}", e);
        }

        self.state.set_public_ip(Some(ip.clone()));
        if !keep_status {
            self.state.set_status(match settings.forwarding_mode {
                ForwardingMode::Disabled => "Registered (port forwarding disabled)".to_string(),
                mode => format!("Registered {} ({})", authority, mode),
            });
        }
        self.publish_addresses(settings, authority, Some(&ip));
    }

    /// Externally visible address: the custom domain itself, the DNS
    /// update provider's answer, or the relay's view of this host
    async fn resolve_ip(&self, settings: &Settings, authority: &Authority) -> Result<String> {
        if settings.forwarding_mode == ForwardingMode::CustomDomain {
            if let Some(hostname) = &authority.hostname {
                return Ok(hostname.clone());
            }
        }

        if let Some((domain, token)) = settings.duckdns() {
            return self.relay.update_duckdns(domain, token).await;
        }

        timeout(RELAY_CHECK_TIMEOUT, self.relay.resolve_ip())
            .await
            .map_err(|_| ReachError::Relay("IP lookup timed out".to_string()))?
    }

    fn publish_addresses(&self, settings: &Settings, authority: &Authority, ip: Option<&str>) {
        let direct_host = authority.hostname.as_deref().or(ip);
        let direct_address = match (settings.forwarding_mode, direct_host) {
            (ForwardingMode::Disabled, _) | (_, None) => None,
            (_, Some(host)) if authority.port == HTTPS_PORT => Some(format!("https://{}", host)),
            (_, Some(host)) => Some(format!("https://{}:{}", host, authority.port)),
        };
        let cloud_address = self
            .state
            .snapshot()
            .tunnel_hostname
            .unwrap_or_else(|| self.relay_origin.clone());

        let addresses = AdvertisedAddresses {
            public_hostname: settings.hostname().map(str::to_string),
            direct_address,
            cloud_address: Some(cloud_address),
            cors_origins: settings.cors_origins.clone(),
        };
        self.addresses.send_if_modified(|current| {
            if *current == addresses {
                return false;
            }
            *current = addresses;
            true
        });
    }

    /// Ask the relay to fetch `/testPortForward` through the public
    /// authority and compare the body with this process's token
    pub async fn test_port_forward(&self) -> Result<()> {
        let authority = self.get_authority().await?;
        let settings = self.settings.get().await;

        let host = match authority.hostname.clone() {
            Some(host) => host,
            None => self
                .state
                .snapshot()
                .public_ip
                .or(settings.last_persisted_ip.clone())
                .ok_or_else(|| {
                    ReachError::Configuration("The public IP address is not known yet".to_string())
                })?,
        };
        let token = self.test_token.get().ok_or_else(|| {
            ReachError::Configuration("The local proxy is not running".to_string())
        })?;

        let url = format!("https://{}:{}/web/testPortForward", host, authority.port);
        info!("Testing port forward via {}", url);

        let result = match timeout(RELAY_CHECK_TIMEOUT, self.relay.curl(&url, settings.token_info())).await
        {
            Ok(Ok(body)) if body == *token => Ok(()),
            Ok(Ok(_)) => Err(ReachError::Relay(format!(
                "{} answered, but not from this server",
                url
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ReachError::Relay(format!("{} timed out", url))),
        };

        match &result {
            Ok(()) => self.state.set_status(STATUS_VERIFIED),
            Err(e) => {
                let message = format!("Port forward test failed: {}", e);
                self.state.set_status(message.clone());
                self.state.raise_alert(message);
            }
        }
        result
    }

    /// Drive debounced and periodic refreshes and follow the tunnel
    /// hostname until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut tunnel_hostname: Option<watch::Receiver<Option<String>>>,
        mut shutdown: ShutdownSignal,
    ) {
        let mut requests = self.refresh_rx.lock().await;
        let mut periodic = tokio::time::interval(REFRESH_INTERVAL);
        periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = periodic.tick() => self.refresh_logged(false).await,
                Some(first) = requests.recv() => {
                    tokio::select! {
                        _ = shutdown.triggered() => break,
                        _ = sleep(REFRESH_DEBOUNCE) => {}
                    }
                    let mut force = first;
                    while let Ok(more) = requests.try_recv() {
                        force |= more;
                    }
                    self.refresh_logged(force).await;
                }
                hostname = next_hostname(&mut tunnel_hostname) => match hostname {
                    Some(hostname) => {
                        if self.state.set_tunnel_hostname(hostname.clone()) {
                            info!("Tunnel hostname is now {:?}", hostname);
                            self.schedule_refresh_port_forward(true);
                        }
                    }
                    None => tunnel_hostname = None,
                },
            }
        }
        debug!("Reachability controller stopped");
    }

    async fn refresh_logged(&self, force: bool) {
        if let Err(e) = self.refresh_port_forward(force).await {
            warn!("Port forward refresh abandoned: {}", e);
        }
    }
}

/// Next tunnel hostname, or `None` once the supervisor is gone. Pending
/// forever without a supervisor.
async fn next_hostname(
    rx: &mut Option<watch::Receiver<Option<String>>>,
) -> Option<Option<String>> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

#[async_trait]
impl OAuthHandler for ReachabilityController {
    async fn complete_login(&self, token_info: &str) -> std::result::Result<(), String> {
        let token = token_info.to_string();
        self.settings
            .update(|s| s.token_info = Some(token))
            .await
            .map_err(|e| e.to_string())?;
        info!("Logged in to the cloud");
        self.schedule_refresh_port_forward(true);
        Ok(())
    }

    async fn device_callback(
        &self,
        device_id: &str,
        callback_url: &str,
    ) -> std::result::Result<(), String> {
        self.devices
            .oauth_callback(device_id, callback_url)
            .await
            .map_err(|e| e.to_string())
    }
}
