//! Transport backends for the communication mesh.
//!
//! This crate provides the concrete implementations of the
//! [`corelib::network`] traits:
//! - `MemoryTransport`: in-process, with fault injection for tests
//! - `TcpTransport`: length-prefixed frames over TCP, optionally TLS
//! - `QuicTransport`: one QUIC stream per frame, TLS always on
//!
//! ## Message Framing
//!
//! Byte-stream backends frame every message with a length prefix:
//!
//! ```text
//! +------------------+-------------------+
//! | Length (4 bytes) | Payload (N bytes) |
//! | (big-endian u32) |                   |
//! +------------------+-------------------+
//! ```

pub mod framing;
pub mod memory;
pub mod quic;
pub mod tcp;
pub mod tls;

use std::sync::Arc;

use corelib::network::Transport;
use corelib::topology::TransportProtocol;

pub use memory::MemoryTransport;
pub use quic::QuicTransport;
pub use tcp::TcpTransport;

/// The networked backend implementing a transport class.
pub fn transport_for(protocol: TransportProtocol) -> Arc<dyn Transport> {
    match protocol {
        TransportProtocol::Tcp => Arc::new(TcpTransport::new()),
        TransportProtocol::Quic => Arc::new(QuicTransport::new()),
    }
}
