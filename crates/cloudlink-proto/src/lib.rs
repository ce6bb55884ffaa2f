//! Cloudlink wire protocol
//!
//! Types shared between the relay-facing pieces of the client: the
//! stream-multiplexing frame format used on callback connections, the
//! one-line handshakes written on every relay TLS connection, the push
//! messages the relay delivers, and the JSON bodies of the relay REST API.

pub mod handshake;
pub mod messages;
pub mod mux;

pub use handshake::{parse_claim, Handshake, HandshakeError};
pub use messages::{
    parse_callback_address, CloudRequest, IpResponse, RegistrationResponse, RelayMessage,
    RelayMessageError, ScopeResponse,
};
pub use mux::{
    Frame, FrameCodec, FrameFlags, FrameType, MuxError, Multiplexer, StreamId, StreamState,
};

/// Maximum mux frame payload (1MB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Stream id 0 is never handed out to a virtual stream
pub const RESERVED_STREAM_ID: u32 = 0;

/// Longest handshake or claim line accepted from the relay
pub const MAX_LINE_LENGTH: usize = 4096;
