//! Core networking abstractions shared across the workspace.
//!
//! The link layer only ever talks to these traits. A backend knows how to
//! open a connection to a host, how to listen on one, and how to move opaque
//! frames; what a frame contains is the link layer's business.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;
use crate::topology::TlsOptions;

/// Per-call options handed to a backend.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Bound on establishing one connection.
    pub connect_timeout: Duration,
    /// Largest frame accepted from the wire.
    pub max_frame_size: usize,
    /// Per-stream receive window for stream-multiplexed backends.
    pub stream_window: Option<u32>,
    /// Client options when connecting, server options when listening.
    pub tls: Option<TlsOptions>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            max_frame_size: 64 * 1024 * 1024,
            stream_window: None,
            tls: None,
        }
    }
}

/// A transport backend.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Opens an outbound connection to `host`.
    async fn connect(
        &self,
        host: &str,
        opts: &TransportOptions,
    ) -> Result<Box<dyn Connection>, TransportError>;

    /// Starts accepting inbound connections on `host`.
    async fn listen(
        &self,
        host: &str,
        opts: &TransportOptions,
    ) -> Result<Box<dyn Listener>, TransportError>;
}

/// Outbound half of a connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Sends one frame; returns once the backend has accepted it.
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Accepting side of a transport.
#[async_trait]
pub trait Listener: Send {
    /// Address actually bound, useful when listening on port 0.
    fn local_addr(&self) -> String;

    async fn accept(&mut self) -> Result<Box<dyn Inbound>, TransportError>;
}

/// Inbound half of an accepted connection.
#[async_trait]
pub trait Inbound: Send {
    fn peer_addr(&self) -> String;

    /// Next frame, or `None` once the peer closed the connection.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}
