//! Inbound dispatch for one context.
//!
//! The [`ReceiverLoop`] owns the local listener. Every accepted connection
//! gets its own reader task; each decoded envelope is routed to the channel
//! registered for its sender rank. Frames that do not decode, come from an
//! unregistered rank, or are addressed to another rank are counted and
//! dropped without disturbing other traffic.
//!
//! Routes are fixed once the loop starts: `add_listener` after `start` is an
//! error.

use std::sync::{Arc, Weak};
use std::time::Duration;

use corelib::envelope::Envelope;
use corelib::error::{Error, Result, TransportError};
use corelib::network::{Inbound, Listener, Transport, TransportOptions};
use corelib::Rank;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::channel::Channel;
use crate::stats::{ReceiverSnapshot, ReceiverStats};

/// Pause after a failed accept so a persistent error cannot spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: String,
}

pub struct ReceiverLoop {
    self_rank: Rank,
    routes: Vec<Option<Weak<Channel>>>,
    transport: Arc<dyn Transport>,
    stats: Arc<ReceiverStats>,
    running: Option<Running>,
}

impl ReceiverLoop {
    pub fn new(self_rank: Rank, world_size: usize, transport: Arc<dyn Transport>) -> Self {
        Self {
            self_rank,
            routes: vec![None; world_size],
            transport,
            stats: Arc::new(ReceiverStats::default()),
            running: None,
        }
    }

    /// Routes envelopes from `rank` to `channel`.
    ///
    /// The loop holds a weak reference; dropping the channel stops delivery
    /// to it.
    pub fn add_listener(&mut self, rank: Rank, channel: &Arc<Channel>) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::Config(
                "listeners must be registered before the receiver loop starts".into(),
            ));
        }
        let world_size = self.routes.len();
        if rank >= world_size || rank == self.self_rank {
            return Err(Error::InvalidRank { rank, world_size });
        }
        if self.routes[rank].is_some() {
            return Err(Error::Config(format!(
                "a listener for rank {rank} is already registered"
            )));
        }
        self.routes[rank] = Some(Arc::downgrade(channel));
        Ok(())
    }

    /// Binds `local_host` and starts dispatching. Returns the bound address.
    #[instrument(skip(self, opts), fields(rank = self.self_rank))]
    pub async fn start(&mut self, local_host: &str, opts: TransportOptions) -> Result<String> {
        if self.running.is_some() {
            return Err(Error::Config("receiver loop already started".into()));
        }
        let listener = self.transport.listen(local_host, &opts).await?;
        let local_addr = listener.local_addr();

        let router = Arc::new(Router {
            self_rank: self.self_rank,
            routes: self.routes.clone(),
            stats: Arc::clone(&self.stats),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, router, shutdown_rx));

        info!(addr = %local_addr, transport = self.transport.name(), "receiver loop started");
        self.running = Some(Running {
            shutdown,
            task,
            local_addr: local_addr.clone(),
        });
        Ok(local_addr)
    }

    /// Stops accepting, ends every reader and releases the listener.
    /// Returns false if the loop was not running.
    pub async fn stop(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            return false;
        };
        let _ = running.shutdown.send(true);
        if let Err(e) = running.task.await {
            error!(error = %e, "receiver loop task failed");
        }
        debug!(rank = self.self_rank, "receiver loop stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<&str> {
        self.running.as_ref().map(|r| r.local_addr.as_str())
    }

    pub fn stats(&self) -> ReceiverSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_handle(&self) -> Arc<ReceiverStats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for ReceiverLoop {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            let _ = running.shutdown.send(true);
        }
    }
}

struct Router {
    self_rank: Rank,
    routes: Vec<Option<Weak<Channel>>>,
    stats: Arc<ReceiverStats>,
}

impl Router {
    fn route(&self, frame: &[u8]) -> Result<()> {
        let envelope = Envelope::decode(frame).map_err(|e| {
            self.stats.record_malformed();
            e
        })?;

        if envelope.receiver != self.self_rank {
            self.stats.record_misrouted();
            return Err(Error::Protocol(format!(
                "envelope for rank {} arrived at rank {}",
                envelope.receiver, self.self_rank
            )));
        }

        let channel = self
            .routes
            .get(envelope.sender)
            .and_then(Option::as_ref)
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                self.stats.record_unregistered();
                Error::Protocol(format!(
                    "no channel registered for sender rank {}",
                    envelope.sender
                ))
            })?;

        self.stats.record_delivered();
        channel.deliver(envelope);
        Ok(())
    }
}

async fn accept_loop(
    mut listener: Box<dyn Listener>,
    router: Arc<Router>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(inbound) => {
                    debug!(peer_addr = %inbound.peer_addr(), "accepted inbound connection");
                    readers.spawn(read_loop(inbound, Arc::clone(&router), shutdown.clone()));
                }
                Err(TransportError::Closed) => {
                    info!("listener closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            _ = shutdown.changed() => break,
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }

    readers.abort_all();
    while readers.join_next().await.is_some() {}
}

async fn read_loop(
    mut inbound: Box<dyn Inbound>,
    router: Arc<Router>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer_addr = inbound.peer_addr();
    loop {
        let frame = tokio::select! {
            frame = inbound.recv() => frame,
            _ = shutdown.changed() => return,
        };
        match frame {
            Ok(Some(frame)) => {
                if let Err(e) = router.route(&frame) {
                    warn!(peer_addr = %peer_addr, error = %e, "rejected inbound frame");
                    // A connection that produced garbage cannot be trusted to
                    // be frame-aligned any more.
                    if matches!(e, Error::Codec(_)) {
                        return;
                    }
                }
            }
            Ok(None) => {
                debug!(peer_addr = %peer_addr, "inbound connection closed by peer");
                return;
            }
            Err(e) => {
                warn!(peer_addr = %peer_addr, error = %e, "inbound connection failed");
                return;
            }
        }
    }
}
