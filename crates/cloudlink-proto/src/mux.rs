//! Stream multiplexing over a single relay connection
//!
//! The relay opens virtual streams on a callback connection; each frame
//! carries the stream it belongs to so many HTTP connections can share one
//! TLS socket.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Stream identifier
pub type StreamId = u32;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Relay asks for a new virtual stream
    Open = 0,
    Data = 1,
    Close = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const RST: u8 = 0b0000_0100;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + frame_type (1) + flags (1) + length (4) = 10 bytes
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn open(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Open, Bytes::new())
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    /// Graceful end of one direction of a stream
    pub fn fin(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new()).with_flags(FrameFlags::new().with_fin())
    }

    /// Abort a stream in both directions
    pub fn reset(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new()).with_flags(FrameFlags::new().with_rst())
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encode frame into `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), MuxError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::FrameTooLarge(payload_len));
        }

        buf.reserve(Self::HEADER_SIZE + payload_len);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(payload_len as u32);
        buf.put_slice(&self.payload);

        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when the frame is not
    /// complete yet.
    pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Self>, MuxError> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..Self::HEADER_SIZE];
        let stream_id = header.get_u32();
        let frame_type = FrameType::try_from(header.get_u8())?;
        let flags = FrameFlags::from_u8(header.get_u8());
        let length = header.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(length as usize));
        }

        if buf.len() < Self::HEADER_SIZE + length as usize {
            buf.reserve(Self::HEADER_SIZE + length as usize - buf.len());
            return Ok(None);
        }

        buf.advance(Self::HEADER_SIZE);
        let payload = buf.split_to(length as usize).freeze();

        Ok(Some(Self {
            stream_id,
            frame_type,
            flags,
            payload,
        }))
    }
}

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("Stream already exists: {0}")]
    StreamAlreadyExists(StreamId),

    #[error("Stream id {0} is reserved")]
    ReservedStreamId(StreamId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// `tokio_util` codec for [`Frame`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MuxError> {
        Frame::decode_from(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MuxError> {
        frame.encode_into(dst)
    }
}

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// We sent FIN; the relay may still send data
    HalfClosedLocal,
    /// Relay sent FIN; we may still send data
    HalfClosedRemote,
    Closed,
}

/// Bookkeeping for the virtual streams of one session.
///
/// Owned by the session's reader task, so it needs no locking.
#[derive(Debug, Default)]
pub struct Multiplexer {
    streams: HashMap<StreamId, StreamState>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream opened by the relay
    pub fn register_stream(&mut self, stream_id: StreamId) -> Result<(), MuxError> {
        if stream_id == crate::RESERVED_STREAM_ID {
            return Err(MuxError::ReservedStreamId(stream_id));
        }

        if self.streams.contains_key(&stream_id) {
            return Err(MuxError::StreamAlreadyExists(stream_id));
        }

        self.streams.insert(stream_id, StreamState::Open);
        Ok(())
    }

    /// Record a FIN in one direction. Returns the new state; a stream that
    /// is closed in both directions is removed.
    pub fn half_close(&mut self, stream_id: StreamId, local: bool) -> Result<StreamState, MuxError> {
        let state = self
            .streams
            .get_mut(&stream_id)
            .ok_or(MuxError::StreamNotFound(stream_id))?;

        *state = match (*state, local) {
            (StreamState::Open, true) => StreamState::HalfClosedLocal,
            (StreamState::Open, false) => StreamState::HalfClosedRemote,
            (StreamState::HalfClosedLocal, false) | (StreamState::HalfClosedRemote, true) => {
                StreamState::Closed
            }
            (current, _) => current,
        };

        let new_state = *state;
        if new_state == StreamState::Closed {
            self.streams.remove(&stream_id);
        }
        Ok(new_state)
    }

    /// Forget a stream entirely (reset or bridge failure)
    pub fn remove_stream(&mut self, stream_id: StreamId) -> bool {
        self.streams.remove(&stream_id).is_some()
    }

    /// Get stream state
    pub fn get_stream_state(&self, stream_id: StreamId) -> Option<StreamState> {
        self.streams.get(&stream_id).copied()
    }

    /// Number of streams that are not fully closed
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }
}
