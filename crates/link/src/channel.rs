//! Point-to-point link from the local party to one peer.
//!
//! A [`Channel`] owns the outbound side (connections to the peer's host, a
//! throttle, the send sequence) and the inbound side (a keyed inbox fed by
//! the receiver loop). Data frames carry a per-pair sequence number; the
//! inbox buffers out-of-order arrivals and hands payloads to `recv` in send
//! order, reassembling chunked payloads on the way.
//!
//! ```text
//! send(key, payload)                       receiver loop
//!   |                                          |
//!   v                                          v
//! throttle.reserve --> chunk --> transport  deliver(envelope)
//!   ^                                          |
//!   |  Ack{bytes}                   Data ------+------> inbox --> recv(key)
//!   +-------------------------------------------------------------+
//!                         (peer acks once the payload is consumed)
//! ```
//!
//! Frames of a payload are transmitted by a detached task, and acks are sent
//! in the background. Dropping a `send` or `recv` future therefore never
//! leaves a sequence gap, leaks throttle window or loses a consumed payload.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use corelib::envelope::{chunk_count, max_frame_size, Body, Chunk, Envelope, MAX_KEY_LEN};
use corelib::error::{Error, Result, TransportError};
use corelib::network::{Connection, Transport, TransportOptions};
use corelib::topology::{ConnectionType, LinkSettings, RetryPolicy, TlsOptions, Verbosity};
use corelib::Rank;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::stats::{ChannelStats, StatsSnapshot};
use crate::throttle::{ReserveError, Throttle};

/// Frames a channel holds for the application before it gives up on the peer.
pub const DEFAULT_MAX_BUFFERED_FRAMES: usize = 1 << 20;

/// Per-channel knobs, derived from validated [`LinkSettings`].
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub connect_timeout: Duration,
    /// Bound on a blocking `recv` and on waiting for throttle window.
    pub timeout: Duration,
    /// Largest payload slice carried by one frame.
    pub payload_limit: usize,
    pub connection_type: ConnectionType,
    pub pool_size: usize,
    pub stream_window: Option<u32>,
    pub retry: RetryPolicy,
    pub verbosity: Verbosity,
    /// Cap on out-of-order plus unconsumed frames in the inbox.
    pub max_buffered: usize,
}

impl ChannelOptions {
    pub fn from_settings(settings: &LinkSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
            timeout: settings.recv_timeout,
            payload_limit: settings.payload_limit,
            connection_type: settings.connection_type,
            pool_size: settings.pool_size,
            stream_window: settings.stream_window,
            retry: settings.retry.clone(),
            verbosity: settings.verbosity,
            max_buffered: DEFAULT_MAX_BUFFERED_FRAMES,
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            timeout: Duration::from_secs(30),
            payload_limit: 1024 * 1024,
            connection_type: ConnectionType::Single,
            pool_size: 1,
            stream_window: None,
            retry: RetryPolicy::default(),
            verbosity: Verbosity::default(),
            max_buffered: DEFAULT_MAX_BUFFERED_FRAMES,
        }
    }
}

/// Outcome of closing something that may already be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Closed,
    AlreadyClosed,
}

struct Fragment {
    key: String,
    chunk: Chunk,
    payload: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
enum Accepted {
    Duplicate,
    Buffered,
    /// Number of payloads that became ready.
    Delivered(usize),
    /// The buffer limit was hit; the frame was not kept.
    Overflow,
}

/// Inbound side: resequencing buffer plus ready payloads per key.
#[derive(Default)]
struct Inbox {
    next_seq: u64,
    pending: BTreeMap<u64, Fragment>,
    partial: HashMap<String, Vec<u8>>,
    ready: HashMap<String, VecDeque<Bytes>>,
    /// Payloads across every `ready` queue.
    ready_len: usize,
}

impl Inbox {
    fn accept(&mut self, seq: u64, fragment: Fragment, limit: usize) -> Accepted {
        if seq < self.next_seq || self.pending.contains_key(&seq) {
            return Accepted::Duplicate;
        }
        if self.pending.len() + self.ready_len >= limit {
            return Accepted::Overflow;
        }
        self.pending.insert(seq, fragment);

        let mut delivered = 0;
        while let Some(fragment) = self.pending.remove(&self.next_seq) {
            self.next_seq += 1;
            if self.assemble(fragment) {
                delivered += 1;
            }
        }
        if delivered == 0 {
            Accepted::Buffered
        } else {
            Accepted::Delivered(delivered)
        }
    }

    /// Chunks of one payload hold contiguous sequence numbers, so in-order
    /// fragments never interleave across payloads.
    fn assemble(&mut self, fragment: Fragment) -> bool {
        let Fragment {
            key,
            chunk,
            payload,
        } = fragment;
        if chunk.count <= 1 {
            self.ready.entry(key).or_default().push_back(Bytes::from(payload));
            self.ready_len += 1;
            return true;
        }

        let buffer = self.partial.entry(key.clone()).or_default();
        if chunk.index == 0 {
            buffer.clear();
        }
        buffer.extend_from_slice(&payload);
        if !chunk.is_last() {
            return false;
        }
        match self.partial.remove(&key) {
            Some(whole) => {
                self.ready.entry(key).or_default().push_back(Bytes::from(whole));
                self.ready_len += 1;
                true
            }
            None => false,
        }
    }

    fn pop(&mut self, key: &str) -> Option<Bytes> {
        let queue = self.ready.get_mut(key)?;
        let payload = queue.pop_front()?;
        if queue.is_empty() {
            self.ready.remove(key);
        }
        self.ready_len -= 1;
        Some(payload)
    }

    fn buffered(&self) -> usize {
        self.pending.len()
    }
}

pub struct Channel {
    local_rank: Rank,
    peer_rank: Rank,
    options: ChannelOptions,
    transport: Arc<dyn Transport>,
    peer_host: Option<String>,
    client_tls: Option<TlsOptions>,
    throttle: Throttle,
    next_seq: AtomicU64,
    pool: Mutex<Vec<Arc<dyn Connection>>>,
    next_conn: AtomicUsize,
    inbox: Mutex<Inbox>,
    arrived: Notify,
    handshake_seen: AtomicBool,
    closed: AtomicBool,
    /// Flips to true on close; interrupts connects and retry backoff.
    close_signal: watch::Sender<bool>,
    overflowed: AtomicBool,
    stats: ChannelStats,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_rank", &self.local_rank)
            .field("peer_rank", &self.peer_rank)
            .field("peer_host", &self.peer_host)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel {
    pub fn new(
        local_rank: Rank,
        peer_rank: Rank,
        options: ChannelOptions,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (close_signal, _) = watch::channel(false);
        Self {
            local_rank,
            peer_rank,
            options,
            transport,
            peer_host: None,
            client_tls: None,
            throttle: Throttle::new(0),
            next_seq: AtomicU64::new(0),
            pool: Mutex::new(Vec::new()),
            next_conn: AtomicUsize::new(0),
            inbox: Mutex::new(Inbox::default()),
            arrived: Notify::new(),
            handshake_seen: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_signal,
            overflowed: AtomicBool::new(false),
            stats: ChannelStats::default(),
        }
    }

    /// Points the channel at the peer's host. Connections are opened lazily.
    pub fn set_peer_host(&mut self, host: impl Into<String>, tls: Option<TlsOptions>) {
        self.peer_host = Some(host.into());
        self.client_tls = tls;
    }

    /// Bytes allowed in flight before `send` blocks; 0 disables the bound.
    pub fn set_throttle_window_size(&mut self, bytes: u64) {
        self.throttle.set_window(bytes);
    }

    pub fn local_rank(&self) -> Rank {
        self.local_rank
    }

    pub fn peer_rank(&self) -> Rank {
        self.peer_rank
    }

    pub fn peer_host(&self) -> Option<&str> {
        self.peer_host.as_deref()
    }

    pub fn throttle_window_size(&self) -> u64 {
        self.throttle.window()
    }

    /// Bytes sent and not yet acknowledged by the peer.
    pub fn in_flight(&self) -> u64 {
        self.throttle.in_flight()
    }

    pub fn throttle_integrity_violations(&self) -> u64 {
        self.throttle.integrity_violations()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Data frames held back waiting for a sequence gap to fill.
    pub fn buffered_frames(&self) -> usize {
        self.inbox.lock().buffered()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(self.closed_error())
        } else {
            Ok(())
        }
    }

    fn closed_error(&self) -> Error {
        if self.overflowed.load(Ordering::Acquire) {
            Error::Protocol(format!(
                "inbound buffer for rank {} exceeded {} frames",
                self.peer_rank, self.options.max_buffered
            ))
        } else {
            Error::ChannelClosed {
                peer: self.peer_rank,
            }
        }
    }

    /// Resolves once the channel is closed.
    async fn closed(&self) {
        let mut signal = self.close_signal.subscribe();
        // The sender lives as long as `self`, so this only ends on close.
        let _ = signal.wait_for(|closed| *closed).await;
    }

    /// Publishes `payload` under `key` to the peer.
    ///
    /// Blocks while the throttle window is exhausted, up to the channel
    /// timeout. Payloads above the payload limit are split into chunks that
    /// the peer reassembles before `recv` sees them.
    ///
    /// Once the window is reserved the payload is committed: dropping the
    /// returned future does not stop its transmission.
    pub async fn send(self: &Arc<Self>, key: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        if key.len() > MAX_KEY_LEN {
            return Err(Error::Config(format!(
                "key of {} bytes exceeds {MAX_KEY_LEN}",
                key.len()
            )));
        }

        let size = payload.len() as u64;
        let deadline = Instant::now() + self.options.timeout;
        match self.throttle.reserve(size, deadline).await {
            Ok(()) => {}
            Err(ReserveError::Timeout) => {
                return Err(Error::Timeout {
                    op: "send",
                    peer: self.peer_rank,
                    after: self.options.timeout,
                })
            }
            Err(ReserveError::Closed) => return Err(self.closed_error()),
        }

        // No await between the reservation and the spawn below.
        let (frames, chunks) = match self.encode_payload(key, &payload) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.throttle.release(size);
                self.shutdown();
                return Err(e);
            }
        };
        let channel = Arc::clone(self);
        let len = payload.len();
        let task =
            tokio::spawn(async move { channel.transmit_payload(frames, size, len).await });
        match task.await {
            Ok(result) => result?,
            Err(e) => {
                error!(peer = self.peer_rank, error = %e, "send task failed");
                return Err(self.closed_error());
            }
        }

        if self.options.verbosity.enabled(Verbosity::Debug) {
            debug!(peer = self.peer_rank, key, len, chunks, "payload sent");
        }
        Ok(())
    }

    /// Takes a contiguous block of sequence numbers and encodes one frame per
    /// chunk.
    fn encode_payload(&self, key: &str, payload: &[u8]) -> Result<(Vec<Bytes>, usize)> {
        let limit = self.options.payload_limit;
        let count = chunk_count(payload.len(), limit);
        let first_seq = self.next_seq.fetch_add(count as u64, Ordering::SeqCst);
        let frames = (0..count)
            .map(|index| {
                let start = index * limit;
                let end = payload.len().min(start + limit);
                Envelope::data(
                    self.local_rank,
                    self.peer_rank,
                    first_seq + index as u64,
                    key,
                    Chunk {
                        index: index as u32,
                        count: count as u32,
                    },
                    &payload[start..end],
                )
                .encode()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((frames, count))
    }

    async fn transmit_payload(&self, frames: Vec<Bytes>, size: u64, len: usize) -> Result<()> {
        for frame in frames {
            if let Err(e) = self.send_frame(frame).await {
                self.throttle.release(size);
                // The peer would wait forever on the unsent sequence numbers.
                self.close().await;
                return Err(e);
            }
        }
        self.stats.record_send(self.peer_rank, len);
        Ok(())
    }

    /// Next payload published by the peer under `key`, waiting up to the
    /// channel timeout.
    pub async fn recv(self: &Arc<Self>, key: &str) -> Result<Bytes> {
        self.recv_timeout(key, self.options.timeout).await
    }

    /// Like [`recv`](Self::recv) with an explicit bound. Elapsing yields
    /// [`Error::Timeout`], never a connectivity error.
    pub async fn recv_timeout(self: &Arc<Self>, key: &str, timeout: Duration) -> Result<Bytes> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut arrived = pin!(self.arrived.notified());
            arrived.as_mut().enable();

            self.ensure_open()?;
            let popped = self.inbox.lock().pop(key);
            if let Some(payload) = popped {
                self.stats.record_recv(self.peer_rank, payload.len());
                self.acknowledge(payload.len() as u64);
                return Ok(payload);
            }

            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return Err(Error::Timeout {
                    op: "recv",
                    peer: self.peer_rank,
                    after: timeout,
                });
            }
        }
    }

    /// Tells the peer, in the background, that `bytes` of its payloads were
    /// consumed.
    fn acknowledge(self: &Arc<Self>, bytes: u64) {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let ack = Envelope::ack(channel.local_rank, channel.peer_rank, bytes);
            match channel.send_envelope(&ack).await {
                Ok(()) => {}
                Err(Error::ChannelClosed { .. }) => {
                    debug!(peer = channel.peer_rank, bytes, "channel closed before ack")
                }
                Err(e) => {
                    warn!(peer = channel.peer_rank, bytes, error = %e, "failed to acknowledge payload")
                }
            }
        });
    }

    /// Announces this party to the peer.
    pub async fn send_handshake(&self) -> Result<()> {
        self.ensure_open()?;
        self.send_envelope(&Envelope::handshake(self.local_rank, self.peer_rank))
            .await
    }

    /// Waits until the peer's handshake has arrived.
    pub async fn wait_handshake(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut arrived = pin!(self.arrived.notified());
            arrived.as_mut().enable();

            self.ensure_open()?;
            if self.handshake_seen.load(Ordering::Acquire) {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return Err(Error::Timeout {
                    op: "handshake",
                    peer: self.peer_rank,
                    after: timeout,
                });
            }
        }
    }

    /// Hands an inbound envelope from the peer to this channel.
    pub(crate) fn deliver(&self, envelope: Envelope) {
        let seq = envelope.seq;
        match envelope.body {
            Body::Ack { bytes } => self.throttle.release(bytes),
            Body::Handshake => {
                self.handshake_seen.store(true, Ordering::Release);
                self.arrived.notify_waiters();
            }
            Body::Data {
                key,
                chunk,
                payload,
            } => {
                let accepted = self.inbox.lock().accept(
                    seq,
                    Fragment {
                        key,
                        chunk,
                        payload,
                    },
                    self.options.max_buffered,
                );
                match accepted {
                    Accepted::Duplicate => {
                        debug!(peer = self.peer_rank, seq, "dropping duplicate frame")
                    }
                    Accepted::Buffered => {
                        trace!(peer = self.peer_rank, seq, "buffered out-of-order frame")
                    }
                    Accepted::Delivered(_) => self.arrived.notify_waiters(),
                    Accepted::Overflow => {
                        error!(
                            peer = self.peer_rank,
                            seq,
                            limit = self.options.max_buffered,
                            "inbound buffer full, closing channel"
                        );
                        self.overflowed.store(true, Ordering::Release);
                        self.shutdown();
                    }
                }
            }
        }
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.send_frame(envelope.encode()?).await
    }

    /// Transmits one encoded frame, reconnecting with backoff.
    ///
    /// Exhausting the retry policy closes the channel. Closing the channel
    /// interrupts a pending connect or backoff.
    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        let retry = &self.options.retry;
        let mut attempt = 0;
        loop {
            self.ensure_open()?;
            attempt += 1;
            let outcome = tokio::select! {
                outcome = self.transmit(frame.clone()) => outcome,
                _ = self.closed() => return Err(self.closed_error()),
            };
            let err = match outcome {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if let TransportError::FrameTooLarge { .. } = err {
                return Err(err.into());
            }
            if attempt >= retry.max_attempts {
                warn!(
                    peer = self.peer_rank,
                    attempts = attempt,
                    error = %err,
                    "peer unreachable, closing channel"
                );
                self.close().await;
                return Err(Error::Connectivity {
                    peer: self.peer_rank,
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }

            let delay = retry.backoff(attempt);
            if self.options.verbosity.enabled(Verbosity::Warn) {
                warn!(
                    peer = self.peer_rank,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "send failed, retrying"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.closed() => return Err(self.closed_error()),
            }
        }
    }

    async fn transmit(&self, frame: Bytes) -> std::result::Result<(), TransportError> {
        if self.options.connection_type == ConnectionType::Short {
            let conn = self.connect().await?;
            let sent = conn.send(frame).await;
            conn.close().await;
            return sent;
        }

        let conn = self.pooled_connection().await?;
        if let Err(e) = conn.send(frame).await {
            self.evict(&conn).await;
            return Err(e);
        }
        Ok(())
    }

    fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: self.options.connect_timeout,
            max_frame_size: max_frame_size(self.options.payload_limit),
            stream_window: self.options.stream_window,
            tls: self.client_tls.clone(),
        }
    }

    async fn connect(&self) -> std::result::Result<Arc<dyn Connection>, TransportError> {
        let host = self.peer_host.as_deref().ok_or_else(|| {
            TransportError::InvalidAddress(format!("no host set for rank {}", self.peer_rank))
        })?;
        let opts = self.transport_options();
        let conn = tokio::time::timeout(
            self.options.connect_timeout,
            self.transport.connect(host, &opts),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;
        Ok(Arc::from(conn))
    }

    /// Round-robins over up to `pool_size` persistent connections, opening
    /// new ones until the pool is full.
    async fn pooled_connection(&self) -> std::result::Result<Arc<dyn Connection>, TransportError> {
        let capacity = self.options.pool_size.max(1);
        {
            let pool = self.pool.lock();
            if pool.len() >= capacity {
                let index = self.next_conn.fetch_add(1, Ordering::Relaxed) % pool.len();
                return Ok(Arc::clone(&pool[index]));
            }
        }

        // The pool is not locked while connecting, so close never waits on
        // a slow peer.
        let conn = self.connect().await?;
        let mut pool = self.pool.lock();
        if pool.len() < capacity && !self.is_closed() {
            pool.push(Arc::clone(&conn));
        }
        // An unpooled connection carries this one frame and is dropped.
        Ok(conn)
    }

    async fn evict(&self, conn: &Arc<dyn Connection>) {
        {
            let target = Arc::as_ptr(conn) as *const ();
            self.pool
                .lock()
                .retain(|c| Arc::as_ptr(c) as *const () != target);
        }
        conn.close().await;
    }

    /// Marks the channel closed and wakes every blocked `send` and `recv`,
    /// along with any connect or backoff in progress.
    pub(crate) fn shutdown(&self) -> CloseStatus {
        if self.closed.swap(true, Ordering::AcqRel) {
            return CloseStatus::AlreadyClosed;
        }
        self.close_signal.send_replace(true);
        self.throttle.close();
        self.arrived.notify_waiters();
        CloseStatus::Closed
    }

    pub(crate) async fn release_connections(&self) {
        let conns: Vec<_> = self.pool.lock().drain(..).collect();
        for conn in conns {
            conn.close().await;
        }
    }

    pub async fn close(&self) -> CloseStatus {
        let status = self.shutdown();
        if status == CloseStatus::Closed {
            debug!(peer = self.peer_rank, "channel closed");
            self.release_connections().await;
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streaming::MemoryTransport;

    fn data(seq: u64, key: &str, index: u32, count: u32, payload: &[u8]) -> Envelope {
        Envelope::data(1, 0, seq, key, Chunk { index, count }, payload)
    }

    fn options() -> ChannelOptions {
        ChannelOptions {
            timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
                multiplier: 1.0,
            },
            ..Default::default()
        }
    }

    /// A channel whose peer has no listener.
    fn detached() -> Arc<Channel> {
        detached_with(options())
    }

    fn detached_with(options: ChannelOptions) -> Arc<Channel> {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let mut channel = Channel::new(0, 1, options, transport);
        channel.set_peer_host("nowhere", None);
        Arc::new(channel)
    }

    /// A channel whose peer listens but never reads; acks are accepted and
    /// dropped. The listener must outlive the channel.
    async fn attached() -> (Arc<Channel>, Box<dyn corelib::network::Listener>) {
        let memory = MemoryTransport::new();
        let listener = memory
            .listen("peer", &TransportOptions::default())
            .await
            .unwrap();
        let mut channel = Channel::new(0, 1, options(), Arc::new(memory));
        channel.set_peer_host("peer", None);
        (Arc::new(channel), listener)
    }

    #[tokio::test]
    async fn test_out_of_order_frames_are_resequenced() {
        let (channel, _listener) = attached().await;
        channel.deliver(data(1, "k", 0, 1, b"second"));
        assert_eq!(channel.buffered_frames(), 1);
        channel.deliver(data(0, "k", 0, 1, b"first"));
        assert_eq!(channel.buffered_frames(), 0);

        assert_eq!(channel.recv("k").await.unwrap(), &b"first"[..]);
        assert_eq!(channel.recv("k").await.unwrap(), &b"second"[..]);
    }

    #[tokio::test]
    async fn test_chunks_reassemble_under_their_key() {
        let (channel, _listener) = attached().await;
        channel.deliver(data(2, "big", 2, 3, b"c"));
        channel.deliver(data(0, "big", 0, 3, b"a"));
        channel.deliver(data(1, "big", 1, 3, b"b"));
        channel.deliver(data(3, "small", 0, 1, b"x"));

        assert_eq!(channel.recv("small").await.unwrap(), &b"x"[..]);
        assert_eq!(channel.recv("big").await.unwrap(), &b"abc"[..]);
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped() {
        let (channel, _listener) = attached().await;
        channel.deliver(data(0, "k", 0, 1, b"once"));
        channel.deliver(data(0, "k", 0, 1, b"once"));

        assert_eq!(channel.recv("k").await.unwrap(), &b"once"[..]);
        let err = channel
            .recv_timeout("k", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_recv_timeout_is_not_a_connectivity_error() {
        let channel = detached();
        let err = channel
            .recv_timeout("missing", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_connectivity());
    }

    #[tokio::test]
    async fn test_recv_returns_before_the_ack_is_sent() {
        // Acks to an unreachable peer retry for seconds in the background.
        let channel = detached_with(ChannelOptions {
            retry: RetryPolicy {
                max_attempts: 5,
                initial_backoff_ms: 1_000,
                max_backoff_ms: 1_000,
                multiplier: 1.0,
            },
            ..options()
        });
        channel.deliver(data(0, "k", 0, 1, b"payload"));

        let received = tokio::time::timeout(
            Duration::from_millis(500),
            channel.recv_timeout("k", Duration::from_millis(10)),
        )
        .await
        .unwrap();
        assert_eq!(received.unwrap(), &b"payload"[..]);
    }

    #[tokio::test]
    async fn test_ack_releases_throttle() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let mut channel = Channel::new(0, 1, options(), transport);
        channel.set_throttle_window_size(10);
        assert!(channel.throttle.try_reserve(10));
        channel.deliver(Envelope::ack(1, 0, 10));
        assert_eq!(channel.in_flight(), 0);
        assert_eq!(channel.throttle_integrity_violations(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer_closes_channel() {
        let channel = detached();
        let err = channel.send("k", Bytes::from_static(b"hi")).await.unwrap_err();
        assert!(err.is_connectivity());
        assert!(channel.is_closed());
        assert_eq!(channel.in_flight(), 0);

        let err = channel.send("k", Bytes::from_static(b"hi")).await.unwrap_err();
        assert!(matches!(err, Error::ChannelClosed { peer: 1 }));
    }

    #[tokio::test]
    async fn test_close_interrupts_retry_backoff() {
        let channel = detached_with(ChannelOptions {
            retry: RetryPolicy {
                max_attempts: 5,
                initial_backoff_ms: 10_000,
                max_backoff_ms: 10_000,
                multiplier: 1.0,
            },
            ..options()
        });
        let sender = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.send("k", Bytes::from_static(b"hi")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let closed = tokio::time::timeout(Duration::from_secs(1), channel.close()).await;
        assert_eq!(closed.unwrap(), CloseStatus::Closed);
        let err = tokio::time::timeout(Duration::from_secs(1), sender)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::ChannelClosed { peer: 1 }));
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_recv() {
        let channel = detached();
        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.recv_timeout("k", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(channel.close().await, CloseStatus::Closed);
        assert_eq!(channel.close().await, CloseStatus::AlreadyClosed);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ChannelClosed { .. }));
    }

    #[tokio::test]
    async fn test_inbox_overflow_closes_channel() {
        let channel = detached_with(ChannelOptions {
            max_buffered: 2,
            ..options()
        });
        // Seq 0 never arrives, so everything queues behind the gap.
        channel.deliver(data(1, "k", 0, 1, b"a"));
        channel.deliver(data(2, "k", 0, 1, b"b"));
        assert!(!channel.is_closed());
        channel.deliver(data(3, "k", 0, 1, b"c"));
        assert!(channel.is_closed());

        let err = channel.recv("k").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_inbox_reports_progress() {
        let mut inbox = Inbox::default();
        let fragment = |payload: &[u8]| Fragment {
            key: "k".into(),
            chunk: Chunk::WHOLE,
            payload: payload.to_vec(),
        };
        assert_eq!(inbox.accept(2, fragment(b"c"), 8), Accepted::Buffered);
        assert_eq!(inbox.accept(1, fragment(b"b"), 8), Accepted::Buffered);
        assert_eq!(inbox.accept(0, fragment(b"a"), 8), Accepted::Delivered(3));
        assert_eq!(inbox.accept(1, fragment(b"b"), 8), Accepted::Duplicate);
    }

    #[test]
    fn test_inbox_limit_counts_unconsumed_payloads() {
        let mut inbox = Inbox::default();
        let fragment = || Fragment {
            key: "k".into(),
            chunk: Chunk::WHOLE,
            payload: vec![1],
        };
        assert_eq!(inbox.accept(0, fragment(), 2), Accepted::Delivered(1));
        assert_eq!(inbox.accept(1, fragment(), 2), Accepted::Delivered(1));
        assert_eq!(inbox.accept(2, fragment(), 2), Accepted::Overflow);

        assert!(inbox.pop("k").is_some());
        assert_eq!(inbox.accept(2, fragment(), 2), Accepted::Delivered(1));
    }
}
