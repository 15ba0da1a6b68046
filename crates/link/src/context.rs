//! One party's view of the mesh.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use corelib::error::{Error, Result};
use corelib::topology::{LinkSettings, Verbosity};
use corelib::{Party, Rank};
use futures::future::try_join_all;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument};

use crate::channel::{Channel, CloseStatus};
use crate::receiver::ReceiverLoop;
use crate::stats::{ReceiverSnapshot, ReceiverStats, StatsSnapshot};

/// A party's handle on a fully wired mesh.
///
/// Holds one [`Channel`] per peer and the running [`ReceiverLoop`]. Built by
/// [`ContextFactory`](crate::ContextFactory); valid until [`close`](Self::close).
pub struct Context {
    settings: LinkSettings,
    parties: Vec<Party>,
    /// Indexed by rank; the local rank's slot is empty.
    channels: Vec<Option<Arc<Channel>>>,
    receiver: AsyncMutex<ReceiverLoop>,
    receiver_stats: Arc<ReceiverStats>,
    local_addr: String,
    closed: AtomicBool,
    collective_seq: AtomicU64,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.settings.id)
            .field("rank", &self.settings.self_rank)
            .field("world_size", &self.settings.world_size)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Context {
    pub(crate) fn new(
        settings: LinkSettings,
        parties: Vec<Party>,
        channels: Vec<Option<Arc<Channel>>>,
        receiver: ReceiverLoop,
        local_addr: String,
    ) -> Self {
        Self {
            receiver_stats: receiver.stats_handle(),
            settings,
            parties,
            channels,
            receiver: AsyncMutex::new(receiver),
            local_addr,
            closed: AtomicBool::new(false),
            collective_seq: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn rank(&self) -> Rank {
        self.settings.self_rank
    }

    pub fn world_size(&self) -> usize {
        self.settings.world_size
    }

    pub fn parties(&self) -> &[Party] {
        &self.parties
    }

    pub fn party(&self, rank: Rank) -> Result<&Party> {
        self.parties.get(rank).ok_or(Error::InvalidRank {
            rank,
            world_size: self.world_size(),
        })
    }

    /// Address the receiver loop actually bound.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    pub fn verbosity(&self) -> Verbosity {
        self.settings.verbosity
    }

    /// Rank `stride` steps after this one on the ring of ranks.
    pub fn next_rank(&self, stride: usize) -> Rank {
        (self.rank() + stride) % self.world_size()
    }

    /// Rank `stride` steps before this one on the ring of ranks.
    pub fn prev_rank(&self, stride: usize) -> Rank {
        let world_size = self.world_size();
        (self.rank() + world_size - stride % world_size) % world_size
    }

    pub fn channel(&self, peer: Rank) -> Result<&Arc<Channel>> {
        self.channels
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidRank {
                rank: peer,
                world_size: self.world_size(),
            })
    }

    /// Channels to every peer, in rank order.
    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> + '_ {
        self.channels.iter().flatten()
    }

    pub fn channel_count(&self) -> usize {
        self.channels().count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ContextClosed)
        } else {
            Ok(())
        }
    }

    pub async fn send(&self, peer: Rank, key: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        self.channel(peer)?.send(key, payload.into()).await
    }

    pub async fn recv(&self, peer: Rank, key: &str) -> Result<Bytes> {
        self.ensure_open()?;
        self.channel(peer)?.recv(key).await
    }

    pub async fn recv_timeout(&self, peer: Rank, key: &str, timeout: Duration) -> Result<Bytes> {
        self.ensure_open()?;
        self.channel(peer)?.recv_timeout(key, timeout).await
    }

    /// Exchanges a handshake with every peer.
    ///
    /// Returns once every peer has been reached and every peer's handshake
    /// arrived, so all parties are known to be up.
    #[instrument(skip(self), fields(id = %self.settings.id, rank = self.rank()))]
    pub async fn connect_to_mesh(&self) -> Result<()> {
        self.ensure_open()?;
        let timeout = self.settings.recv_timeout;
        try_join_all(self.channels().map(|channel| async move {
            channel.send_handshake().await?;
            channel.wait_handshake(timeout).await
        }))
        .await?;
        info!(peers = self.channel_count(), "connected to mesh");
        Ok(())
    }

    /// Shuts the context down.
    ///
    /// Blocked operations on every channel fail with a closed error, then the
    /// receiver loop stops, then outbound connections are released. Calling
    /// it again reports [`CloseStatus::AlreadyClosed`].
    #[instrument(skip(self), fields(id = %self.settings.id, rank = self.rank()))]
    pub async fn close(&self) -> CloseStatus {
        if self.closed.swap(true, Ordering::AcqRel) {
            return CloseStatus::AlreadyClosed;
        }
        for channel in self.channels() {
            channel.shutdown();
        }
        self.receiver.lock().await.stop().await;
        for channel in self.channels() {
            channel.release_connections().await;
        }
        info!("context closed");
        CloseStatus::Closed
    }

    /// Payload traffic summed over every channel.
    pub fn stats(&self) -> StatsSnapshot {
        self.channels()
            .map(|channel| channel.stats())
            .fold(StatsSnapshot::default(), |acc, s| acc + s)
    }

    pub fn receiver_stats(&self) -> ReceiverSnapshot {
        self.receiver_stats.snapshot()
    }

    /// Fresh key for a collective. Every party calls collectives in the same
    /// order, so the n-th call yields the same key everywhere.
    pub(crate) fn next_collective_key(&self, tag: &str) -> String {
        let seq = self.collective_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}:{tag}:{seq}", self.settings.id)
    }
}
