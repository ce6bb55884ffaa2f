//! Standing pool of reverse connections
//!
//! Each slot holds one outbound TLS connection to the relay that has written
//! `reverse:<registrationId>` and waits for the relay's claim line. A claimed
//! connection is spliced byte-for-byte onto the internal proxy listener.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cloudlink_proto::{Handshake, MAX_LINE_LENGTH};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::dialer::{BoxedRelayStream, RelayDialer};
use crate::error::{ReachError, Result};
use crate::shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};

/// Idle connections kept open at all times
pub const POOL_WATERMARK: usize = 10;

/// Wait before redialing a slot whose connection attempt failed
pub const REDIAL_DELAY: Duration = Duration::from_secs(5);

/// An unclaimed connection the relay drops sooner than this counts as a
/// refused dial and is retried after [`REDIAL_DELAY`]
pub const MIN_IDLE_LIFETIME: Duration = Duration::from_secs(1);

pub type SlotId = u64;

/// Slot bookkeeping, kept apart from I/O so the top-up arithmetic is
/// evaluated once per change.
#[derive(Debug)]
pub struct PoolSlots {
    watermark: usize,
    next_id: SlotId,
    idle: BTreeSet<SlotId>,
}

impl PoolSlots {
    pub fn new(watermark: usize) -> Self {
        Self {
            watermark,
            next_id: 1,
            idle: BTreeSet::new(),
        }
    }

    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    /// Allocate enough new slots to reach the watermark. The returned ids are
    /// already counted as idle, so a re-entrant call cannot overshoot.
    pub fn top_up(&mut self) -> Vec<SlotId> {
        let deficit = self.watermark.saturating_sub(self.idle.len());
        let mut added = Vec::with_capacity(deficit);
        for _ in 0..deficit {
            let id = self.next_id;
            self.next_id += 1;
            self.idle.insert(id);
            added.push(id);
        }
        added
    }

    /// The relay claimed `slot`; it no longer counts as idle
    pub fn claim(&mut self, slot: SlotId) -> Vec<SlotId> {
        self.idle.remove(&slot);
        self.top_up()
    }

    /// The connection behind `slot` closed
    pub fn closed(&mut self, slot: SlotId, claimed: bool) -> Vec<SlotId> {
        if !claimed {
            self.idle.remove(&slot);
        }
        self.top_up()
    }
}

/// Connection parameters shared by every pool run
pub struct ReversePool {
    dialer: Arc<dyn RelayDialer>,
    relay_host: String,
    relay_port: u16,
    internal_addr: SocketAddr,
    watermark: usize,
    redial_delay: Duration,
}

struct PoolRun {
    pool: Arc<ReversePool>,
    handshake: String,
    slots: Mutex<PoolSlots>,
    stop: ShutdownSignal,
}

/// A running pool. Dropping the handle stops idle slots; claimed
/// connections finish on their own.
pub struct PoolHandle {
    run: Arc<PoolRun>,
    trigger: ShutdownTrigger,
}

impl PoolHandle {
    pub async fn idle(&self) -> usize {
        self.run.slots.lock().await.idle()
    }

    pub fn stop(&self) {
        self.trigger.trigger();
    }
}

enum SlotOutcome {
    Claimed(BufReader<BoxedRelayStream>),
    Closed,
}

impl ReversePool {
    pub fn new(
        dialer: Arc<dyn RelayDialer>,
        relay_host: impl Into<String>,
        relay_port: u16,
        internal_addr: SocketAddr,
    ) -> Self {
        Self {
            dialer,
            relay_host: relay_host.into(),
            relay_port,
            internal_addr,
            watermark: POOL_WATERMARK,
            redial_delay: REDIAL_DELAY,
        }
    }

    pub fn with_watermark(mut self, watermark: usize) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn with_redial_delay(mut self, delay: Duration) -> Self {
        self.redial_delay = delay;
        self
    }

    /// Open the pool for `registration_id`
    pub async fn start(self: &Arc<Self>, registration_id: &str) -> Result<PoolHandle> {
        let handshake = Handshake::reverse(registration_id)
            .map_err(|e| ReachError::Relay(e.to_string()))?
            .to_line();
        let (trigger, stop) = shutdown_channel();

        let run = Arc::new(PoolRun {
            pool: self.clone(),
            handshake,
            slots: Mutex::new(PoolSlots::new(self.watermark)),
            stop,
        });

        let initial = run.slots.lock().await.top_up();
        info!(
            "Opening {} reverse connections to {}:{}",
            initial.len(),
            self.relay_host,
            self.relay_port
        );
        spawn_slots(&run, initial);

        Ok(PoolHandle { run, trigger })
    }

    async fn wait_for_claim(&self, handshake: &str) -> Result<SlotOutcome> {
        let mut stream = self.dialer.dial(&self.relay_host, self.relay_port).await?;
        stream.write_all(handshake.as_bytes()).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let read = (&mut reader)
            .take(MAX_LINE_LENGTH as u64)
            .read_line(&mut line)
            .await?;

        if read == 0 || !line.ends_with('\n') {
            return Ok(SlotOutcome::Closed);
        }

        debug!("Relay claimed reverse connection: {:?}", line.trim_end());
        Ok(SlotOutcome::Claimed(reader))
    }

    async fn splice(&self, mut relay: BufReader<BoxedRelayStream>) -> Result<(u64, u64)> {
        let mut local = TcpStream::connect(self.internal_addr).await?;
        local.set_nodelay(true)?;
        Ok(tokio::io::copy_bidirectional(&mut relay, &mut local).await?)
    }
}

fn spawn_slots(run: &Arc<PoolRun>, slots: Vec<SlotId>) {
    if run.stop.is_triggered() {
        return;
    }
    for slot in slots {
        tokio::spawn(run_slot(run.clone(), slot));
    }
}

async fn run_slot(run: Arc<PoolRun>, slot: SlotId) {
    let mut stop = run.stop.clone();

    let outcome = loop {
        let dialed_at = Instant::now();
        let attempt = tokio::select! {
            _ = stop.triggered() => return,
            attempt = run.pool.wait_for_claim(&run.handshake) => attempt,
        };

        match attempt {
            Ok(SlotOutcome::Closed) if dialed_at.elapsed() < MIN_IDLE_LIFETIME => {
                warn!(slot = slot, "Relay dropped the reverse connection right away");
            }
            Ok(outcome) => break outcome,
            Err(e) => warn!(slot = slot, "Reverse connection failed: {}", e),
        }
        tokio::select! {
            _ = stop.triggered() => return,
            _ = tokio::time::sleep(run.pool.redial_delay) => {}
        }
    };

    let claimed = match outcome {
        SlotOutcome::Claimed(relay) => {
            let replacements = run.slots.lock().await.claim(slot);
            spawn_slots(&run, replacements);

            match run.pool.splice(relay).await {
                Ok((to_local, to_relay)) => debug!(
                    slot = slot,
                    bytes_to_local = to_local,
                    bytes_to_relay = to_relay,
                    "Reverse connection finished"
                ),
                Err(e) => debug!(slot = slot, "Reverse connection ended: {}", e),
            }
            true
        }
        SlotOutcome::Closed => {
            debug!(slot = slot, "Idle reverse connection closed by relay");
            false
        }
    };

    let replacements = run.slots.lock().await.closed(slot, claimed);
    spawn_slots(&run, replacements);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDialer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_top_up_fills_to_watermark_once() {
        let mut slots = PoolSlots::new(POOL_WATERMARK);
        assert_eq!(slots.top_up().len(), POOL_WATERMARK);
        assert!(slots.top_up().is_empty());
        assert_eq!(slots.idle(), POOL_WATERMARK);
    }

    #[test]
    fn test_each_removal_schedules_one_replacement() {
        let mut slots = PoolSlots::new(POOL_WATERMARK);
        let ids = slots.top_up();

        let mut replacements = 0;
        for id in &ids[..3] {
            replacements += slots.closed(*id, false).len();
        }
        assert_eq!(replacements, 3);
        assert_eq!(slots.idle(), POOL_WATERMARK);
    }

    #[test]
    fn test_claim_replaces_and_claimed_close_does_not_overshoot() {
        let mut slots = PoolSlots::new(POOL_WATERMARK);
        let ids = slots.top_up();

        assert_eq!(slots.claim(ids[0]).len(), 1);
        assert_eq!(slots.idle(), POOL_WATERMARK);

        assert!(slots.closed(ids[0], true).is_empty());
        assert_eq!(slots.idle(), POOL_WATERMARK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_opens_watermark_connections_and_replaces_closed() {
        let (dialer, mut relay) = FakeDialer::new();
        let internal: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let pool = Arc::new(ReversePool::new(Arc::new(dialer), "relay.example.com", 4001, internal));

        let handle = pool.start("reg-1").await.unwrap();

        let mut connections = Vec::new();
        for _ in 0..POOL_WATERMARK {
            let mut conn = relay.recv().await.unwrap();
            let mut line = vec![0u8; "reverse:reg-1\n".len()];
            conn.read_exact(&mut line).await.unwrap();
            assert_eq!(line, b"reverse:reg-1\n");
            connections.push(conn);
        }
        assert_eq!(handle.idle().await, POOL_WATERMARK);

        tokio::time::sleep(MIN_IDLE_LIFETIME * 2).await;
        drop(connections.pop());
        drop(connections.pop());

        let closed_at = Instant::now();
        for _ in 0..2 {
            relay.recv().await.unwrap();
        }
        assert!(closed_at.elapsed() < REDIAL_DELAY);
        assert!(relay.try_recv().is_err());
        assert_eq!(handle.idle().await, POOL_WATERMARK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_relay_hangup_redials_after_delay() {
        let (dialer, mut relay) = FakeDialer::new();
        let internal: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let pool = Arc::new(
            ReversePool::new(Arc::new(dialer), "relay.example.com", 4001, internal).with_watermark(1),
        );
        let handle = pool.start("reg-1").await.unwrap();

        let started = Instant::now();
        drop(relay.recv().await.unwrap());
        let second = relay.recv().await.unwrap();
        assert!(started.elapsed() >= REDIAL_DELAY);
        assert_eq!(handle.idle().await, 1);

        drop(second);
        relay.recv().await.unwrap();
        assert!(started.elapsed() >= REDIAL_DELAY * 2);
    }

    #[tokio::test]
    async fn test_claimed_connection_is_spliced_to_internal_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let internal = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(b"pong:").await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let (dialer, mut relay) = FakeDialer::new();
        let pool = Arc::new(
            ReversePool::new(Arc::new(dialer), "relay.example.com", 4001, internal).with_watermark(1),
        );
        let _handle = pool.start("reg-1").await.unwrap();

        let mut conn = relay.recv().await.unwrap();
        let mut line = vec![0u8; "reverse:reg-1\n".len()];
        conn.read_exact(&mut line).await.unwrap();

        // claim line and the first payload bytes arrive in one write
        conn.write_all(b"claim\nhello").await.unwrap();

        let mut reply = [0u8; 10];
        conn.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong:hello");

        // the claimed slot was backfilled
        let mut replacement = relay.recv().await.unwrap();
        let mut line = vec![0u8; "reverse:reg-1\n".len()];
        replacement.read_exact(&mut line).await.unwrap();
        assert_eq!(line, b"reverse:reg-1\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dial_keeps_slot_and_retries() {
        let (dialer, mut relay) = FakeDialer::new();
        dialer.fail_next(2);
        let internal: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let pool = Arc::new(
            ReversePool::new(Arc::new(dialer), "relay.example.com", 4001, internal).with_watermark(1),
        );
        let handle = pool.start("reg-1").await.unwrap();

        let started = tokio::time::Instant::now();
        relay.recv().await.unwrap();
        assert!(started.elapsed() >= REDIAL_DELAY * 2);
        assert_eq!(handle.idle().await, 1);
    }

    #[tokio::test]
    async fn test_stopped_pool_does_not_refill() {
        let (dialer, mut relay) = FakeDialer::new();
        let internal: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let pool = Arc::new(
            ReversePool::new(Arc::new(dialer), "relay.example.com", 4001, internal).with_watermark(2),
        );
        let handle = pool.start("reg-1").await.unwrap();

        let first = relay.recv().await.unwrap();
        let _second = relay.recv().await.unwrap();

        handle.stop();
        drop(first);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(relay.try_recv().is_err());
    }
}
