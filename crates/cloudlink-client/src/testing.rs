//! In-crate fakes for the injected collaborators

use async_trait::async_trait;
use cloudlink_proto::{CloudRequest, RegistrationResponse, ScopeResponse};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::dispatch::DeviceHandlers;
use crate::error::{ReachError, Result};
use crate::portmap::{PortMapper, PortMapping};
use crate::relay::{RelayApi, Registration};
use crate::reverse::{BoxedRelayStream, RelayDialer};
use crate::state::AlertSink;

#[derive(Default)]
pub struct RecordingAlerts {
    pub messages: Mutex<Vec<String>>,
}

impl AlertSink for RecordingAlerts {
    fn alert(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

/// Hands the relay side of every dialed connection to the test
pub struct FakeDialer {
    connections: mpsc::UnboundedSender<DuplexStream>,
    failures: AtomicUsize,
    pub dialed: Arc<Mutex<Vec<(String, u16)>>>,
}

impl FakeDialer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Self {
            connections: tx,
            failures: AtomicUsize::new(0),
            dialed: Arc::new(Mutex::new(Vec::new())),
        };
        (dialer, rx)
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelayDialer for FakeDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedRelayStream> {
        self.dialed.lock().unwrap().push((host.to_string(), port));

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ReachError::Relay("connection refused".to_string()));
        }

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        self.connections
            .send(theirs)
            .map_err(|_| ReachError::Relay("test relay gone".to_string()))?;
        Ok(Box::new(ours))
    }
}

/// Scripted relay REST API
pub struct FakeRelay {
    pub ip: Mutex<String>,
    pub register_response: Mutex<RegistrationResponse>,
    pub curl_body: Mutex<String>,
    pub registrations: Mutex<Vec<(Registration, String)>>,
    pub scopes: Mutex<Vec<(String, Duration)>>,
    pub curls: Mutex<Vec<String>>,
    pub duckdns_updates: Mutex<Vec<String>>,
    pub ip_lookups: AtomicUsize,
}

impl FakeRelay {
    pub fn new(ip: &str) -> Self {
        Self {
            ip: Mutex::new(ip.to_string()),
            register_response: Mutex::new(RegistrationResponse {
                ip_address: Some(ip.to_string()),
                error: None,
            }),
            curl_body: Mutex::new(String::new()),
            registrations: Mutex::new(Vec::new()),
            scopes: Mutex::new(Vec::new()),
            curls: Mutex::new(Vec::new()),
            duckdns_updates: Mutex::new(Vec::new()),
            ip_lookups: AtomicUsize::new(0),
        }
    }

    pub fn set_ip(&self, ip: &str) {
        *self.ip.lock().unwrap() = ip.to_string();
        self.register_response.lock().unwrap().ip_address = Some(ip.to_string());
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    pub fn last_registration(&self) -> Option<Registration> {
        self.registrations
            .lock()
            .unwrap()
            .last()
            .map(|(registration, _)| registration.clone())
    }
}

#[async_trait]
impl RelayApi for FakeRelay {
    async fn resolve_ip(&self) -> Result<String> {
        self.ip_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.ip.lock().unwrap().clone())
    }

    async fn register(
        &self,
        registration: &Registration,
        token: &str,
    ) -> Result<RegistrationResponse> {
        self.registrations
            .lock()
            .unwrap()
            .push((registration.clone(), token.to_string()));
        Ok(self.register_response.lock().unwrap().clone())
    }

    async fn scope(&self, path: &str, ttl: Duration, _token: &str) -> Result<ScopeResponse> {
        let mut scopes = self.scopes.lock().unwrap();
        scopes.push((path.to_string(), ttl));
        Ok(ScopeResponse {
            user_token: format!("user-{}", scopes.len()),
            user_token_signature: format!("sig-{}", scopes.len()),
        })
    }

    async fn curl(&self, url: &str, _token: Option<&str>) -> Result<String> {
        self.curls.lock().unwrap().push(url.to_string());
        Ok(self.curl_body.lock().unwrap().clone())
    }

    async fn update_duckdns(&self, domain: &str, _token: &str) -> Result<String> {
        self.duckdns_updates.lock().unwrap().push(domain.to_string());
        Ok(self.ip.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeMapper {
    pub fail: std::sync::atomic::AtomicBool,
    pub mappings: Mutex<Vec<PortMapping>>,
}

#[async_trait]
impl PortMapper for FakeMapper {
    async fn map_port(&self, mapping: &PortMapping) -> Result<()> {
        self.mappings.lock().unwrap().push(mapping.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ReachError::Mapping("no gateway".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingDevices {
    pub pushes: Mutex<Vec<(String, CloudRequest)>>,
    pub callbacks: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl DeviceHandlers for RecordingDevices {
    async fn push(&self, device_id: &str, request: CloudRequest) -> Result<()> {
        self.pushes
            .lock()
            .unwrap()
            .push((device_id.to_string(), request));
        Ok(())
    }

    async fn oauth_callback(&self, device_id: &str, callback_url: &str) -> Result<()> {
        self.callbacks
            .lock()
            .unwrap()
            .push((device_id.to_string(), callback_url.to_string()));
        Ok(())
    }
}
