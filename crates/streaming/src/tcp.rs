//! TCP transport implementation.
//!
//! One TCP connection carries frames in one direction: the connecting side
//! writes, the accepting side reads. When TLS options are given the stream is
//! wrapped with rustls; the server handshake runs on the inbound stream's
//! first `recv`, so a slow client never stalls the accept loop. The
//! handshake is bounded by the connect timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use corelib::error::TransportError;
use corelib::network::{Connection, Inbound, Listener, Transport, TransportOptions};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, instrument};

use crate::framing::{read_frame, write_frame};
use crate::tls;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Reader = Box<dyn AsyncRead + Send + Unpin>;

/// TCP backend with length-prefixed framing.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    #[instrument(skip(self, opts), fields(tls = opts.tls.is_some()))]
    async fn connect(
        &self,
        host: &str,
        opts: &TransportOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let connect_failed = |reason: String| TransportError::ConnectFailed {
            addr: host.to_string(),
            reason,
        };

        let stream = tokio::time::timeout(opts.connect_timeout, TcpStream::connect(host))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| connect_failed(e.to_string()))?;
        stream.set_nodelay(true)?;

        let writer: Writer = match &opts.tls {
            Some(tls_opts) => {
                let config = tls::client_config(tls_opts)?;
                let name = tls::server_name(tls_opts, host)?;
                let connector = TlsConnector::from(Arc::new(config));
                let tls_stream =
                    tokio::time::timeout(opts.connect_timeout, connector.connect(name, stream))
                        .await
                        .map_err(|_| TransportError::Timeout)?
                        .map_err(|e| connect_failed(format!("TLS handshake: {e}")))?;
                Box::new(tls_stream)
            }
            None => Box::new(stream),
        };

        debug!(host, "TCP connection established");
        Ok(Box::new(TcpConnection {
            writer: Mutex::new(Some(writer)),
        }))
    }

    #[instrument(skip(self, opts), fields(tls = opts.tls.is_some()))]
    async fn listen(
        &self,
        host: &str,
        opts: &TransportOptions,
    ) -> Result<Box<dyn Listener>, TransportError> {
        let acceptor = match &opts.tls {
            Some(tls_opts) => Some(TlsAcceptor::from(Arc::new(tls::server_config(tls_opts)?))),
            None => None,
        };
        let listener = TcpListener::bind(host)
            .await
            .map_err(|e| TransportError::BindFailed {
                addr: host.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?.to_string();
        info!(addr = %local_addr, "TCP transport listening");

        Ok(Box::new(TcpListenerHandle {
            listener,
            local_addr,
            acceptor,
            handshake_timeout: opts.connect_timeout,
            max_frame_size: opts.max_frame_size,
        }))
    }
}

struct TcpConnection {
    writer: Mutex<Option<Writer>>,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        // Held outside the slot while writing: a failed or cancelled write
        // may leave half a frame on the stream, which is then dropped.
        let mut writer = guard.take().ok_or(TransportError::Closed)?;
        write_frame(&mut writer, &frame).await?;
        *guard = Some(writer);
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

struct TcpListenerHandle {
    listener: TcpListener,
    local_addr: String,
    acceptor: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    max_frame_size: usize,
}

#[async_trait]
impl Listener for TcpListenerHandle {
    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    async fn accept(&mut self) -> Result<Box<dyn Inbound>, TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let state = match &self.acceptor {
            Some(acceptor) => InboundState::Handshake(acceptor.clone(), stream),
            None => InboundState::Ready(Box::new(stream)),
        };
        Ok(Box::new(TcpInbound {
            peer: addr.to_string(),
            state,
            handshake_timeout: self.handshake_timeout,
            max_frame_size: self.max_frame_size,
        }))
    }
}

enum InboundState {
    Handshake(TlsAcceptor, TcpStream),
    Ready(Reader),
    Failed,
}

struct TcpInbound {
    peer: String,
    state: InboundState,
    handshake_timeout: Duration,
    max_frame_size: usize,
}

#[async_trait]
impl Inbound for TcpInbound {
    fn peer_addr(&self) -> String {
        self.peer.clone()
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        // A failed handshake leaves the state at `Failed`.
        self.state = match std::mem::replace(&mut self.state, InboundState::Failed) {
            InboundState::Handshake(acceptor, stream) => {
                let tls_stream =
                    tokio::time::timeout(self.handshake_timeout, acceptor.accept(stream))
                        .await
                        .map_err(|_| TransportError::Timeout)?
                        .map_err(|e| {
                            TransportError::Tls(format!("handshake with {}: {e}", self.peer))
                        })?;
                InboundState::Ready(Box::new(tls_stream))
            }
            other => other,
        };

        match &mut self.state {
            InboundState::Ready(reader) => read_frame(reader, self.max_frame_size).await,
            _ => Err(TransportError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let transport = TcpTransport::new();
        let opts = TransportOptions::default();
        let mut listener = transport.listen("127.0.0.1:0", &opts).await.unwrap();
        let addr = listener.local_addr();

        let conn = transport.connect(&addr, &opts).await.unwrap();
        conn.send(Bytes::from_static(b"ping")).await.unwrap();

        let mut inbound = listener.accept().await.unwrap();
        assert_eq!(inbound.recv().await.unwrap().unwrap(), &b"ping"[..]);

        conn.close().await;
        assert!(inbound.recv().await.unwrap().is_none());
        assert!(conn.send(Bytes::from_static(b"late")).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let transport = TcpTransport::new();
        let opts = TransportOptions::default();
        let listener = transport.listen("127.0.0.1:0", &opts).await.unwrap();

        let err = transport
            .listen(&listener.local_addr(), &opts)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::BindFailed { .. }));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port and release it so nothing listens there.
        let addr = {
            let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            scratch.local_addr().unwrap().to_string()
        };
        let err = TcpTransport::new()
            .connect(&addr, &TransportOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
    }
}
