//! In-process transport.
//!
//! Every `MemoryTransport` clone shares one address registry, so a whole mesh
//! can run inside a single test process. Addresses are arbitrary strings.
//! Hosts can be partitioned to simulate an unreachable peer: connects to a
//! partitioned host fail and sends on existing connections to it error.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use corelib::error::TransportError;
use corelib::network::{Connection, Inbound, Listener, Transport, TransportOptions};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Default)]
struct Registry {
    listeners: HashMap<String, mpsc::UnboundedSender<MemoryInbound>>,
    partitioned: HashSet<String>,
}

/// In-memory transport backend.
#[derive(Clone)]
pub struct MemoryTransport {
    registry: Arc<Mutex<Registry>>,
    /// Frames buffered per connection before `send` waits.
    capacity: usize,
    next_conn: Arc<AtomicU64>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            capacity: capacity.max(1),
            next_conn: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Makes `host` unreachable until [`heal`](Self::heal) is called.
    pub fn partition(&self, host: &str) {
        self.registry.lock().partitioned.insert(host.to_string());
    }

    pub fn heal(&self, host: &str) {
        self.registry.lock().partitioned.remove(host);
    }

    /// True while a listener is bound to `host`.
    pub fn is_listening(&self, host: &str) -> bool {
        self.registry
            .lock()
            .listeners
            .get(host)
            .is_some_and(|tx| !tx.is_closed())
    }

    fn is_partitioned(&self, host: &str) -> bool {
        self.registry.lock().partitioned.contains(host)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(
        &self,
        host: &str,
        opts: &TransportOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        {
            let registry = self.registry.lock();
            if registry.partitioned.contains(host) {
                return Err(TransportError::ConnectFailed {
                    addr: host.to_string(),
                    reason: "host unreachable".into(),
                });
            }
            let acceptor = registry.listeners.get(host).ok_or_else(|| {
                TransportError::ConnectFailed {
                    addr: host.to_string(),
                    reason: "connection refused".into(),
                }
            })?;
            acceptor
                .send(MemoryInbound {
                    peer: format!("mem-{id}"),
                    rx,
                })
                .map_err(|_| TransportError::ConnectFailed {
                    addr: host.to_string(),
                    reason: "connection refused".into(),
                })?;
        }

        debug!(host, conn = id, "memory connection opened");
        Ok(Box::new(MemoryConnection {
            host: host.to_string(),
            transport: self.clone(),
            max_frame_size: opts.max_frame_size,
            tx: Mutex::new(Some(tx)),
        }))
    }

    async fn listen(
        &self,
        host: &str,
        _opts: &TransportOptions,
    ) -> Result<Box<dyn Listener>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry.lock();
        if registry
            .listeners
            .get(host)
            .is_some_and(|existing| !existing.is_closed())
        {
            return Err(TransportError::BindFailed {
                addr: host.to_string(),
                reason: "address in use".into(),
            });
        }
        registry.listeners.insert(host.to_string(), tx);
        Ok(Box::new(MemoryListener {
            host: host.to_string(),
            registry: Arc::clone(&self.registry),
            rx,
        }))
    }
}

struct MemoryConnection {
    host: String,
    transport: MemoryTransport,
    max_frame_size: usize,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                limit: self.max_frame_size,
            });
        }
        if self.transport.is_partitioned(&self.host) {
            return Err(TransportError::Closed);
        }
        let tx = self.tx.lock().clone().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        self.tx.lock().take();
    }
}

struct MemoryListener {
    host: String,
    registry: Arc<Mutex<Registry>>,
    rx: mpsc::UnboundedReceiver<MemoryInbound>,
}

#[async_trait]
impl Listener for MemoryListener {
    fn local_addr(&self) -> String {
        self.host.clone()
    }

    async fn accept(&mut self) -> Result<Box<dyn Inbound>, TransportError> {
        match self.rx.recv().await {
            Some(inbound) => Ok(Box::new(inbound)),
            None => Err(TransportError::Closed),
        }
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.rx.close();
        let mut registry = self.registry.lock();
        if registry
            .listeners
            .get(&self.host)
            .is_some_and(|tx| tx.is_closed())
        {
            registry.listeners.remove(&self.host);
        }
    }
}

struct MemoryInbound {
    peer: String,
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl Inbound for MemoryInbound {
    fn peer_addr(&self) -> String {
        self.peer.clone()
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}
