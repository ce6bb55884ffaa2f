//! Relay push message dispatch
//!
//! The push transport is external; whatever receives pushes feeds
//! [`RelayEvent`]s into the channel consumed by [`Dispatcher::run`].

use std::sync::Arc;

use async_trait::async_trait;
use cloudlink_proto::{CloudRequest, RelayMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::controller::ReachabilityController;
use crate::error::Result;
use crate::reverse::{CallbackConnector, PoolHandle, ReversePool};
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// The push registration id was issued or rotated
    RegistrationId(String),
    Message(RelayMessage),
}

/// Per-device hooks of the host application
#[async_trait]
pub trait DeviceHandlers: Send + Sync {
    /// A `cloudmessage` addressed to `/push/<device_id>`
    async fn push(&self, device_id: &str, request: CloudRequest) -> Result<()>;

    /// A device OAuth flow completed
    async fn oauth_callback(&self, device_id: &str, callback_url: &str) -> Result<()>;
}

/// Host without device handlers; everything is logged and dropped
pub struct UnhandledDevices;

#[async_trait]
impl DeviceHandlers for UnhandledDevices {
    async fn push(&self, device_id: &str, request: CloudRequest) -> Result<()> {
        warn!("No handler for push to device {} ({})", device_id, request.path());
        Ok(())
    }

    async fn oauth_callback(&self, device_id: &str, _callback_url: &str) -> Result<()> {
        warn!("No handler for OAuth callback of device {}", device_id);
        Ok(())
    }
}

pub struct Dispatcher {
    controller: Arc<ReachabilityController>,
    pool: Option<Arc<ReversePool>>,
    callbacks: Arc<CallbackConnector>,
    devices: Arc<dyn DeviceHandlers>,
    registration_id: Option<String>,
    pool_handle: Option<PoolHandle>,
}

impl Dispatcher {
    pub fn new(
        controller: Arc<ReachabilityController>,
        pool: Option<Arc<ReversePool>>,
        callbacks: Arc<CallbackConnector>,
        devices: Arc<dyn DeviceHandlers>,
    ) -> Self {
        Self {
            controller,
            pool,
            callbacks,
            devices,
            registration_id: None,
            pool_handle: None,
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<RelayEvent>, mut shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        debug!("Relay event channel closed");
                        break;
                    }
                },
            }
        }

        if let Some(handle) = self.pool_handle.take() {
            handle.stop();
        }
    }

    async fn handle(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::RegistrationId(id) => self.on_registration_id(id).await,
            RelayEvent::Message(RelayMessage::Callback { address }) => self.on_callback(address),
            RelayEvent::Message(RelayMessage::CloudMessage { request }) => {
                self.on_cloud_message(request)
            }
        }
    }

    async fn on_registration_id(&mut self, id: String) {
        if self.registration_id.as_deref() == Some(id.as_str()) {
            return;
        }
        info!("Push registration id updated");
        self.registration_id = Some(id.clone());
        self.controller.set_registration_id(id.clone());

        if let Some(old) = self.pool_handle.take() {
            old.stop();
        }

        let Some(pool) = &self.pool else {
            return;
        };
        if !self.controller.settings().get().await.connect_to_relay {
            debug!("Cloud connection disabled; reverse pool not started");
            return;
        }
        match pool.start(&id).await {
            Ok(handle) => self.pool_handle = Some(handle),
            Err(e) => warn!("Could not start reverse connection pool: {}", e),
        }
    }

    fn on_callback(&self, address: String) {
        let Some(id) = self.registration_id.clone() else {
            warn!("Ignoring relay callback to {}: no registration id yet", address);
            return;
        };
        let callbacks = self.callbacks.clone();
        tokio::spawn(async move {
            if let Err(e) = callbacks.answer(&address, &id).await {
                warn!("Callback to {} failed: {}", address, e);
            }
        });
    }

    fn on_cloud_message(&self, request: CloudRequest) {
        let device_id = match request.device_id() {
            Ok(id) => id.to_string(),
            Err(e) => {
                warn!("Dropping cloud message: {}", e);
                return;
            }
        };
        let devices = self.devices.clone();
        tokio::spawn(async move {
            if let Err(e) = devices.push(&device_id, request).await {
                warn!("Push handler for device {} failed: {}", device_id, e);
            }
        });
    }
}
