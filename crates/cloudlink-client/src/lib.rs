//! Remote reachability for a server behind NAT
//!
//! The [`controller::ReachabilityController`] decides how the server is
//! reached and keeps the relay informed. The tunnel supervisor keeps an
//! external tunnel process alive, and the reverse connection pool and
//! callback sessions let the relay reach in without any inbound port.

pub mod authority;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod portmap;
pub mod registration;
pub mod relay;
pub mod reverse;
pub mod settings;
pub mod shutdown;
pub mod state;
pub mod tunnel;
pub mod whitelist;

#[cfg(test)]
mod testing;

pub use authority::{compute_authority, Authority};
pub use controller::{ReachabilityController, REFRESH_DEBOUNCE, REFRESH_INTERVAL};
pub use dispatch::{DeviceHandlers, Dispatcher, RelayEvent, UnhandledDevices};
pub use error::{ReachError, Result};
pub use portmap::{PortMapper, PortMapping, UpnpPortMapper};
pub use registration::{RegistrationClient, ServerIdentity};
pub use relay::{HttpRelayClient, RelayApi, Registration, DEFAULT_SENDER_ID};
pub use reverse::{CallbackConnector, RelayDialer, ReversePool, TlsRelayDialer, POOL_WATERMARK};
pub use settings::{visibility, FieldVisibility, ForwardingMode, Settings, SettingsStore};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use state::{AlertSink, LogAlertSink, ReachabilityState, StateHandle};
pub use tunnel::{BinaryInstaller, CommandLauncher, SupervisorState, TunnelMode, TunnelSupervisor};
pub use whitelist::{PublicUrlConverter, UrlLifetime};
