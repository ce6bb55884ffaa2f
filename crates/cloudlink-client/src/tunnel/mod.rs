//! External tunnel process: binary management, launching, supervision

pub mod backoff;
pub mod binary;
pub mod launcher;
pub mod log_parser;
pub mod supervisor;

pub use backoff::{Backoff, BackoffConfig};
pub use binary::{BinaryInstaller, TUNNEL_VERSION};
pub use launcher::{CommandLauncher, LaunchedTunnel, ProcessLauncher, TunnelMode};
pub use log_parser::{parse_quick_tunnel_url, parse_tunnel_log};
pub use supervisor::{SupervisorState, TunnelSupervisor};
