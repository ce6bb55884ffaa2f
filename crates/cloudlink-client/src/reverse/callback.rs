//! Solicited callback connections
//!
//! When the relay pushes a `callback` message we dial the named edge, write
//! the bare registration id, wait for the acknowledgement line and then run
//! a multiplexed session: every virtual stream the relay opens is bridged to
//! its own loopback connection into the internal proxy listener.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use cloudlink_proto::{
    parse_callback_address, Frame, FrameCodec, FrameType, Handshake, Multiplexer, StreamId,
    StreamState, MAX_LINE_LENGTH,
};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::dialer::RelayDialer;
use crate::error::{ReachError, Result};

const FRAME_QUEUE: usize = 256;
const STREAM_QUEUE: usize = 64;
const READ_BUFFER: usize = 16 * 1024;

enum BridgeEvent {
    /// The local side finished sending
    LocalFin(StreamId),
    Failed(StreamId, io::Error),
}

struct StreamEntry {
    data: Option<mpsc::Sender<Bytes>>,
    task: JoinHandle<()>,
}

/// Answers relay `callback` requests
pub struct CallbackConnector {
    dialer: Arc<dyn RelayDialer>,
    internal_addr: SocketAddr,
}

impl CallbackConnector {
    pub fn new(dialer: Arc<dyn RelayDialer>, internal_addr: SocketAddr) -> Self {
        Self {
            dialer,
            internal_addr,
        }
    }

    /// Dial `address` and serve virtual streams until the relay hangs up
    pub async fn answer(&self, address: &str, registration_id: &str) -> Result<()> {
        let (host, port) =
            parse_callback_address(address).map_err(|e| ReachError::Relay(e.to_string()))?;
        let handshake = Handshake::callback(registration_id)
            .map_err(|e| ReachError::Relay(e.to_string()))?;

        let mut stream = self.dialer.dial(&host, port).await?;
        stream.write_all(handshake.to_line().as_bytes()).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut ack = String::new();
        (&mut reader)
            .take(MAX_LINE_LENGTH as u64)
            .read_line(&mut ack)
            .await?;
        if !ack.ends_with('\n') {
            return Err(ReachError::Relay(format!(
                "relay edge {} closed the callback before acknowledging",
                address
            )));
        }

        info!("Callback session established with {}", address);
        let (read_half, write_half) = tokio::io::split(reader);
        let frames_in = FramedRead::new(read_half, FrameCodec);
        let mut frames_out = FramedWrite::new(write_half, FrameCodec);

        let (frames_tx, mut frames_rx) = mpsc::channel::<Frame>(FRAME_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if let Err(e) = frames_out.send(frame).await {
                    debug!("Callback writer stopped: {}", e);
                    break;
                }
            }
        });

        let result = Session::new(self.internal_addr, frames_tx).run(frames_in).await;
        writer.abort();

        info!("Callback session with {} ended", address);
        result
    }
}

struct Session {
    internal_addr: SocketAddr,
    mux: Multiplexer,
    streams: HashMap<StreamId, StreamEntry>,
    frames: mpsc::Sender<Frame>,
    events_tx: mpsc::Sender<BridgeEvent>,
    events_rx: mpsc::Receiver<BridgeEvent>,
}

impl Session {
    fn new(internal_addr: SocketAddr, frames: mpsc::Sender<Frame>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(FRAME_QUEUE);
        Self {
            internal_addr,
            mux: Multiplexer::new(),
            streams: HashMap::new(),
            frames,
            events_tx,
            events_rx,
        }
    }

    async fn run<S>(mut self, mut frames_in: S) -> Result<()>
    where
        S: futures::Stream<Item = std::result::Result<Frame, cloudlink_proto::MuxError>> + Unpin,
    {
        let result = loop {
            tokio::select! {
                frame = frames_in.next() => match frame {
                    Some(Ok(frame)) => self.on_frame(frame).await,
                    Some(Err(e)) => break Err(ReachError::Relay(format!("callback stream: {}", e))),
                    None => break Ok(()),
                },
                Some(event) = self.events_rx.recv() => self.on_bridge_event(event).await,
            }
        };

        for (_, entry) in self.streams.drain() {
            entry.task.abort();
        }
        result
    }

    async fn on_frame(&mut self, frame: Frame) {
        let id = frame.stream_id;
        match frame.frame_type {
            FrameType::Open => self.open(id).await,
            FrameType::Data => {
                let sender = self.streams.get(&id).and_then(|entry| entry.data.clone());
                match sender {
                    Some(sender) => {
                        if sender.send(frame.payload).await.is_err() {
                            self.reset(id).await;
                        }
                    }
                    None => {
                        debug!(stream_id = id, "Data for unknown stream");
                        self.reset(id).await;
                    }
                }
            }
            FrameType::Close if frame.flags.has_rst() => {
                debug!(stream_id = id, "Relay reset stream");
                self.mux.remove_stream(id);
                if let Some(entry) = self.streams.remove(&id) {
                    entry.task.abort();
                }
            }
            FrameType::Close => match self.mux.half_close(id, false) {
                Ok(state) => {
                    if let Some(entry) = self.streams.get_mut(&id) {
                        entry.data = None;
                    }
                    if state == StreamState::Closed {
                        self.streams.remove(&id);
                    }
                }
                Err(e) => debug!(stream_id = id, "Ignoring FIN: {}", e),
            },
        }
    }

    async fn open(&mut self, id: StreamId) {
        if let Err(e) = self.mux.register_stream(id) {
            warn!(stream_id = id, "Rejecting stream: {}", e);
            let _ = self.frames.send(Frame::reset(id)).await;
            return;
        }

        let (data_tx, data_rx) = mpsc::channel(STREAM_QUEUE);
        let task = tokio::spawn(bridge(
            id,
            self.internal_addr,
            data_rx,
            self.frames.clone(),
            self.events_tx.clone(),
        ));
        self.streams.insert(
            id,
            StreamEntry {
                data: Some(data_tx),
                task,
            },
        );
        debug!(stream_id = id, "Opened virtual stream");
    }

    async fn on_bridge_event(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::LocalFin(id) => {
                if self.frames.send(Frame::fin(id)).await.is_err() {
                    return;
                }
                if let Ok(StreamState::Closed) = self.mux.half_close(id, true) {
                    self.streams.remove(&id);
                }
            }
            BridgeEvent::Failed(id, e) => {
                debug!(stream_id = id, "Bridge failed: {}", e);
                self.reset(id).await;
            }
        }
    }

    async fn reset(&mut self, id: StreamId) {
        self.mux.remove_stream(id);
        if let Some(entry) = self.streams.remove(&id) {
            entry.task.abort();
        }
        let _ = self.frames.send(Frame::reset(id)).await;
    }
}

/// Copy one virtual stream to and from a fresh loopback connection
async fn bridge(
    id: StreamId,
    internal_addr: SocketAddr,
    mut data_rx: mpsc::Receiver<Bytes>,
    frames: mpsc::Sender<Frame>,
    events: mpsc::Sender<BridgeEvent>,
) {
    let result = async {
        let local = TcpStream::connect(internal_addr).await?;
        local.set_nodelay(true)?;
        let (mut local_read, mut local_write) = local.into_split();

        let inbound = async {
            while let Some(chunk) = data_rx.recv().await {
                local_write.write_all(&chunk).await?;
            }
            local_write.shutdown().await?;
            Ok::<_, io::Error>(())
        };

        let outbound = async {
            let mut buf = vec![0u8; READ_BUFFER];
            loop {
                let n = local_read.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                frames
                    .send(Frame::data(id, Bytes::copy_from_slice(&buf[..n])))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "session closed"))?;
            }
            let _ = events.send(BridgeEvent::LocalFin(id)).await;
            Ok::<_, io::Error>(())
        };

        tokio::try_join!(inbound, outbound).map(|_| ())
    }
    .await;

    if let Err(e) = result {
        let _ = events.send(BridgeEvent::Failed(id, e)).await;
    }
}
