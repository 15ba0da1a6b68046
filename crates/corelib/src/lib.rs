//! Core library for the rank-addressed communication mesh.
//!
//! This crate provides the vocabulary shared by every other crate:
//! - Parties and ranks
//! - Topology descriptors and their validation
//! - The link envelope and its wire codec
//! - Transport capability traits implemented by backends
//! - Error types

pub mod envelope;
pub mod error;
pub mod network;
pub mod party;
pub mod topology;

pub use envelope::{Body, Chunk, Envelope};
pub use error::{Error, Result, TransportError};
pub use network::{Connection, Inbound, Listener, Transport, TransportOptions};
pub use party::{Party, Rank};
pub use topology::{
    ConnectionType, LinkSettings, RetryPolicy, TlsOptions, TlsPair, TopologyDescriptor,
    TransportProtocol, Verbosity,
};
