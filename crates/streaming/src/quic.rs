//! QUIC transport implementation.
//!
//! Each frame travels on its own unidirectional stream, so frames of one
//! connection may be read in a different order than they were sent; the link
//! layer resequences them. TLS is mandatory for QUIC. The stream window from
//! [`TransportOptions::stream_window`] becomes the per-stream receive window.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use corelib::error::TransportError;
use corelib::network::{Connection, Inbound, Listener, Transport, TransportOptions};
use quinn::{ConnectionError, Endpoint, ReadToEndError, VarInt};
use tracing::{debug, info, instrument, warn};

use crate::tls;

/// QUIC backend built on quinn.
#[derive(Debug, Clone, Default)]
pub struct QuicTransport;

impl QuicTransport {
    pub fn new() -> Self {
        Self
    }
}

async fn resolve(host: &str) -> Result<SocketAddr, TransportError> {
    tokio::net::lookup_host(host)
        .await
        .map_err(|_| TransportError::InvalidAddress(host.to_string()))?
        .next()
        .ok_or_else(|| TransportError::InvalidAddress(host.to_string()))
}

fn transport_config(opts: &TransportOptions) -> Arc<quinn::TransportConfig> {
    let mut config = quinn::TransportConfig::default();
    if let Some(window) = opts.stream_window {
        config.stream_receive_window(VarInt::from_u32(window));
    }
    Arc::new(config)
}

fn is_clean_close(err: &ConnectionError) -> bool {
    matches!(
        err,
        ConnectionError::ApplicationClosed(_)
            | ConnectionError::ConnectionClosed(_)
            | ConnectionError::LocallyClosed
    )
}

#[async_trait]
impl Transport for QuicTransport {
    fn name(&self) -> &'static str {
        "quic"
    }

    #[instrument(skip(self, opts))]
    async fn connect(
        &self,
        host: &str,
        opts: &TransportOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let tls_opts = opts
            .tls
            .as_ref()
            .ok_or_else(|| TransportError::Tls("quic requires client TLS options".into()))?;
        let addr = resolve(host).await?;

        let mut client_config = quinn::ClientConfig::with_root_certificates(tls::client_roots(tls_opts)?);
        client_config.transport_config(transport_config(opts));

        let bind: SocketAddr = if addr.is_ipv6() {
            "[::]:0".parse().map_err(|_| TransportError::InvalidAddress("[::]:0".into()))?
        } else {
            "0.0.0.0:0".parse().map_err(|_| TransportError::InvalidAddress("0.0.0.0:0".into()))?
        };
        let endpoint = Endpoint::client(bind)?;

        let server_name = tls::server_name_str(tls_opts, host);
        let connecting = endpoint
            .connect_with(client_config, addr, &server_name)
            .map_err(|e| TransportError::ConnectFailed {
                addr: host.to_string(),
                reason: e.to_string(),
            })?;
        let connection = tokio::time::timeout(opts.connect_timeout, connecting)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectFailed {
                addr: host.to_string(),
                reason: e.to_string(),
            })?;

        debug!(host, "QUIC connection established");
        Ok(Box::new(QuicConnection {
            _endpoint: endpoint,
            connection,
            max_frame_size: opts.max_frame_size,
        }))
    }

    #[instrument(skip(self, opts))]
    async fn listen(
        &self,
        host: &str,
        opts: &TransportOptions,
    ) -> Result<Box<dyn Listener>, TransportError> {
        let tls_opts = opts
            .tls
            .as_ref()
            .ok_or_else(|| TransportError::Tls("quic requires server TLS options".into()))?;
        let (certs, key) = tls::server_identity(tls_opts)?;
        let mut server_config = quinn::ServerConfig::with_single_cert(certs, key)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        server_config.transport_config(transport_config(opts));

        let addr = resolve(host).await?;
        let endpoint = Endpoint::server(server_config, addr).map_err(|e| {
            TransportError::BindFailed {
                addr: host.to_string(),
                reason: e.to_string(),
            }
        })?;
        let local_addr = endpoint.local_addr()?.to_string();
        info!(addr = %local_addr, "QUIC transport listening");

        Ok(Box::new(QuicListener {
            endpoint,
            local_addr,
            max_frame_size: opts.max_frame_size,
        }))
    }
}

struct QuicConnection {
    // Held so the client endpoint lives as long as the connection.
    _endpoint: Endpoint,
    connection: quinn::Connection,
    max_frame_size: usize,
}

#[async_trait]
impl Connection for QuicConnection {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                limit: self.max_frame_size,
            });
        }
        let mut stream = self
            .connection
            .open_uni()
            .await
            .map_err(|_| TransportError::Closed)?;
        stream
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::Io(e.into()))?;
        stream
            .finish()
            .await
            .map_err(|e| TransportError::Io(e.into()))?;
        Ok(())
    }

    async fn close(&self) {
        self.connection.close(VarInt::from_u32(0), b"closed");
    }
}

struct QuicListener {
    endpoint: Endpoint,
    local_addr: String,
    max_frame_size: usize,
}

#[async_trait]
impl Listener for QuicListener {
    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    async fn accept(&mut self) -> Result<Box<dyn Inbound>, TransportError> {
        let connecting = self.endpoint.accept().await.ok_or(TransportError::Closed)?;
        Ok(Box::new(QuicInbound {
            peer: connecting.remote_address().to_string(),
            state: InboundState::Connecting(connecting),
            max_frame_size: self.max_frame_size,
        }))
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
    }
}

enum InboundState {
    Connecting(quinn::Connecting),
    Ready(quinn::Connection),
    Failed,
}

struct QuicInbound {
    peer: String,
    state: InboundState,
    max_frame_size: usize,
}

#[async_trait]
impl Inbound for QuicInbound {
    fn peer_addr(&self) -> String {
        self.peer.clone()
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        self.state = match std::mem::replace(&mut self.state, InboundState::Failed) {
            InboundState::Connecting(connecting) => {
                let connection = connecting.await.map_err(|e| {
                    TransportError::Tls(format!("handshake with {}: {e}", self.peer))
                })?;
                InboundState::Ready(connection)
            }
            other => other,
        };

        let InboundState::Ready(connection) = &self.state else {
            return Err(TransportError::Closed);
        };
        let mut stream = match connection.accept_uni().await {
            Ok(stream) => stream,
            Err(e) if is_clean_close(&e) => return Ok(None),
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "QUIC connection lost");
                return Err(TransportError::Closed);
            }
        };
        match stream.read_to_end(self.max_frame_size).await {
            Ok(frame) => Ok(Some(Bytes::from(frame))),
            Err(ReadToEndError::TooLong) => Err(TransportError::FrameTooLarge {
                len: self.max_frame_size + 1,
                limit: self.max_frame_size,
            }),
            Err(ReadToEndError::Read(e)) => Err(TransportError::Io(e.into())),
        }
    }
}
