//! Process-wide reachability state
//!
//! One owned aggregate behind a watch channel. Writers go through the
//! mutation methods on [`StateHandle`]; readers take snapshots or subscribe
//! to transitions.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use crate::authority::Authority;

/// Receives user-visible alerts
pub trait AlertSink: Send + Sync {
    fn alert(&self, message: &str);
}

/// Alerts go to the log only
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, message: &str) {
        warn!(target: "cloudlink::alert", "{}", message);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReachabilityState {
    /// Human readable forwarding status
    pub status: String,
    /// Authority most recently computed
    pub authority: Option<Authority>,
    /// Public hostname of the running tunnel, as `https://host`
    pub tunnel_hostname: Option<String>,
    /// IP the relay last confirmed
    pub public_ip: Option<String>,
    pub alerts: Vec<String>,
}

pub struct StateHandle {
    tx: watch::Sender<ReachabilityState>,
    sink: Arc<dyn AlertSink>,
}

impl StateHandle {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        let (tx, _) = watch::channel(ReachabilityState::default());
        Self { tx, sink }
    }

    pub fn snapshot(&self) -> ReachabilityState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReachabilityState> {
        self.tx.subscribe()
    }

    pub fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        self.tx.send_if_modified(|state| {
            if state.status == status {
                return false;
            }
            state.status = status;
            true
        });
    }

    pub fn set_authority(&self, authority: Option<Authority>) {
        self.tx.send_if_modified(|state| {
            if state.authority == authority {
                return false;
            }
            state.authority = authority;
            true
        });
    }

    pub fn set_public_ip(&self, ip: Option<String>) {
        self.tx.send_if_modified(|state| {
            if state.public_ip == ip {
                return false;
            }
            state.public_ip = ip;
            true
        });
    }

    /// Returns whether the hostname changed
    pub fn set_tunnel_hostname(&self, hostname: Option<String>) -> bool {
        self.tx.send_if_modified(|state| {
            if state.tunnel_hostname == hostname {
                return false;
            }
            state.tunnel_hostname = hostname;
            true
        })
    }

    /// Raise an alert unless the same one is already active
    pub fn raise_alert(&self, message: impl Into<String>) {
        let message = message.into();
        let raised = self.tx.send_if_modified(|state| {
            if state.alerts.contains(&message) {
                return false;
            }
            state.alerts.push(message.clone());
            true
        });
        if raised {
            self.sink.alert(&message);
        }
    }

    /// Called at the start of a settings-driven re-evaluation
    pub fn clear_alerts(&self) {
        self.tx.send_if_modified(|state| {
            if state.alerts.is_empty() {
                return false;
            }
            state.alerts.clear();
            true
        });
    }
}
