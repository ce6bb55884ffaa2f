//! Cloudlink - make a server behind NAT reachable from the internet
//!
//! Runs the TLS front door, keeps the relay registration current, supervises
//! the tunnel process and holds reverse connections open for the relay.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use cloudlink_cert::IdentityStore;
use cloudlink_client::authority::effective_secure_port;
use cloudlink_client::{
    shutdown_channel, BinaryInstaller, CallbackConnector, CommandLauncher, Dispatcher,
    HttpRelayClient, LogAlertSink, ReachabilityController, RelayEvent, ReversePool,
    ServerIdentity, SettingsStore, ShutdownSignal, StateHandle, TlsRelayDialer, TunnelMode,
    TunnelSupervisor, UnhandledDevices, UpnpPortMapper, DEFAULT_SENDER_ID,
};
use cloudlink_proxy::{OAuthHandler, ProxyConfig, ProxyServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{load_config_file, resolve, ConfigFile, Overrides, RuntimeConfig};

/// Cloudlink remote access server
#[derive(Parser, Debug)]
#[command(name = "cloudlink")]
#[command(about = "Make a server behind NAT reachable through UPnP, a custom domain, a tunnel or relay reverse connections")]
#[command(version = env!("GIT_TAG"))]
#[command(long_about = r#"
Cloudlink fronts an internal HTTP application with a TLS listener and keeps
it reachable from the internet. Depending on the forwarding mode in
settings.json it maps a port with UPnP, registers a router forward or a custom
domain with the relay, runs a tunnel process, and keeps reverse connections
open so the relay can reach in without any inbound port.

EXAMPLES:
  # Front an application on port 10080
  cloudlink --target 127.0.0.1:10080

  # Use a config file
  cloudlink --config cloudlink.yaml

ENVIRONMENT VARIABLES:
  CLOUDLINK_RELAY_URL        Relay REST origin
  CLOUDLINK_TARGET           Internal application address (host:port)
  CLOUDLINK_DATA_DIR         Settings, identity and tunnel binary cache
  CLOUDLINK_REGISTRATION_ID  Push registration id
"#)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "CLOUDLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Relay REST origin (e.g. https://relay.example.com)
    #[arg(long, env = "CLOUDLINK_RELAY_URL")]
    relay_url: Option<String>,

    /// Host reverse connections are dialed to (defaults to the relay url host)
    #[arg(long, env = "CLOUDLINK_RELAY_TUNNEL_HOST")]
    relay_tunnel_host: Option<String>,

    /// Port reverse connections are dialed to
    #[arg(long, env = "CLOUDLINK_RELAY_TUNNEL_PORT")]
    relay_tunnel_port: Option<u16>,

    /// Skip certificate verification on relay connections (development only)
    #[arg(long, env = "CLOUDLINK_INSECURE_RELAY")]
    insecure_relay: bool,

    /// Push registration id, when no push transport supplies one
    #[arg(long, env = "CLOUDLINK_REGISTRATION_ID")]
    registration_id: Option<String>,

    /// Internal application address (host:port)
    #[arg(long, env = "CLOUDLINK_TARGET")]
    target: Option<String>,

    /// Data directory
    #[arg(long, env = "CLOUDLINK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Loopback port for relay traffic (0 picks a free port)
    #[arg(long, env = "CLOUDLINK_INTERNAL_PORT")]
    internal_port: Option<u16>,

    /// Tunnel binary to run instead of downloading one
    #[arg(long, env = "CLOUDLINK_TUNNEL_BINARY")]
    tunnel_binary: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CLOUDLINK_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<RuntimeConfig> {
        let file = match &self.config {
            Some(path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };
        resolve(
            file,
            Overrides {
                relay_url: self.relay_url,
                relay_tunnel_host: self.relay_tunnel_host,
                relay_tunnel_port: self.relay_tunnel_port,
                insecure_relay: self.insecure_relay,
                registration_id: self.registration_id,
                target: self.target,
                data_dir: self.data_dir,
                internal_port: self.internal_port,
                tunnel_binary: self.tunnel_binary,
                log_level: self.log_level,
            },
        )
    }
}

/// Setup logging. `RUST_LOG` wins over the configured level.
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Log every status transition
async fn log_status(state: Arc<StateHandle>, mut shutdown: ShutdownSignal) {
    let mut rx = state.subscribe();
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let snapshot = rx.borrow_and_update().clone();
                info!(
                    status = %snapshot.status,
                    authority = ?snapshot.authority.as_ref().map(ToString::to_string),
                    tunnel = ?snapshot.tunnel_hostname,
                    alerts = snapshot.alerts.len(),
                    "Reachability changed"
                );
            }
            _ = shutdown.triggered() => return,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;
    setup_logging(&config.log_level)?;

    info!(
        "Cloudlink {} ({}, built {})",
        env!("GIT_TAG"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );
    info!("Relay: {}", config.relay_url);
    info!("Target: {}", config.target);
    info!("Data directory: {}", config.data_dir.display());
    if !config.verify_relay_tls {
        warn!("⚠️  Relay certificate verification disabled (insecure mode)");
    }

    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("Failed to create data directory: {}", config.data_dir.display())
    })?;

    let identity = IdentityStore::new(config.data_dir.join("identity.json"))
        .load_or_create()
        .context("Failed to load server identity")?;
    let settings = Arc::new(
        SettingsStore::open(config.data_dir.join("settings.json"))
            .context("Failed to load settings")?,
    );
    let state = Arc::new(StateHandle::new(Arc::new(LogAlertSink)));
    let relay = Arc::new(HttpRelayClient::new(config.relay_url.clone())?);

    let controller = Arc::new(ReachabilityController::new(
        settings.clone(),
        state.clone(),
        relay.clone(),
        Arc::new(UpnpPortMapper::new()?),
        Arc::new(UnhandledDevices),
        ServerIdentity {
            server_id: identity.server_id.clone(),
            registration_secret: identity.registration_secret.clone(),
            sender_id: DEFAULT_SENDER_ID.to_string(),
        },
        config.relay_url.clone(),
    ));

    // Choose the UPnP port before binding, the listener follows it
    if let Err(e) = controller.get_authority().await {
        warn!("{}", e);
    }
    let current = settings.get().await;

    let tls = identity
        .certificate()
        .and_then(|cert| cert.server_config())
        .context("Failed to build TLS configuration")?;
    let proxy_config = ProxyConfig {
        internal_addr: SocketAddr::from(([127, 0, 0, 1], config.internal_port)),
        secure_addr: SocketAddr::from(([0, 0, 0, 0], effective_secure_port(&current))),
        target: config.target,
    };
    let oauth: Arc<dyn OAuthHandler> = controller.clone();
    let proxy = ProxyServer::new(proxy_config, tls, oauth, controller.addresses())
        .bind()
        .await?;
    controller.set_test_token(proxy.test_token());
    let internal_addr = proxy.internal_addr();
    let secure_addr = proxy.secure_addr();
    controller.set_listening_port(secure_addr.port());

    if current.token_info().is_none() {
        let redirect = format!("https://localhost:{}/web/oauth/callback", secure_addr.port());
        info!("Not logged in. Log in at {}", relay.login_url(&redirect));
    }

    let (trigger, shutdown) = shutdown_channel();
    let mut tasks = Vec::new();

    let tunnel_hostname = if current.tunnel_enabled {
        let installer = BinaryInstaller::new(config.data_dir.join("tunnel"))?
            .with_override(config.tunnel_binary.clone());
        let supervisor = Arc::new(TunnelSupervisor::new(Arc::new(CommandLauncher::new(
            Arc::new(installer),
        ))));
        let mode = match current.tunnel_token() {
            Some(token) => TunnelMode::Named {
                token: token.to_string(),
            },
            None => TunnelMode::Quick {
                local_url: format!("https://localhost:{}", secure_addr.port()),
            },
        };
        let hostname = supervisor.hostname();
        let signal = shutdown.clone();
        tasks.push(tokio::spawn(async move { supervisor.run(mode, signal).await }));
        Some(hostname)
    } else {
        info!("Tunnel disabled in settings");
        None
    };

    let dialer = Arc::new(TlsRelayDialer::new(config.verify_relay_tls)?);
    let pool = Arc::new(ReversePool::new(
        dialer.clone(),
        config.relay_tunnel_host.clone(),
        config.relay_tunnel_port,
        internal_addr,
    ));
    let dispatcher = Dispatcher::new(
        controller.clone(),
        Some(pool),
        Arc::new(CallbackConnector::new(dialer, internal_addr)),
        Arc::new(UnhandledDevices),
    );

    // An embedding push transport feeds this channel
    let (events, event_rx) = mpsc::channel(64);
    tasks.push(tokio::spawn(dispatcher.run(event_rx, shutdown.clone())));
    if let Some(id) = config.registration_id.clone() {
        events
            .send(RelayEvent::RegistrationId(id))
            .await
            .context("Relay dispatcher stopped")?;
    }

    tasks.push(tokio::spawn(
        controller.clone().run(tunnel_hostname, shutdown.clone()),
    ));
    tasks.push(tokio::spawn(log_status(state.clone(), shutdown.clone())));

    info!("Listening on {} (internal {})", secure_addr, internal_addr);
    let mut proxy_task = tokio::spawn(proxy.run());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = &mut proxy_task => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Proxy stopped: {}", e);
                Err(e.into())
            }
            Err(e) => {
                error!("Proxy task panicked: {}", e);
                Err(e.into())
            }
        },
    };

    trigger.trigger();
    drop(events);
    proxy_task.abort();
    for task in tasks {
        let _ = task.await;
    }

    info!("Cloudlink stopped");
    result
}
