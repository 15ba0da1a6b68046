//! Error types for the core library.
//!
//! Two layers: [`TransportError`] is what a backend reports about a single
//! connection or listener, [`Error`] is what callers of the link layer see.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::party::Rank;

/// Result type alias for the core library.
pub type Result<T> = std::result::Result<T, Error>;

/// Caller-visible errors.
#[derive(Debug, Error)]
pub enum Error {
    /// `self_rank` does not address a party of the topology.
    #[error("invalid self rank={self_rank}, world_size={world_size}")]
    InvalidTopology { self_rank: Rank, world_size: usize },

    /// A peer rank outside the topology or equal to the local rank.
    #[error("invalid peer rank={rank}, world_size={world_size}")]
    InvalidRank { rank: Rank, world_size: usize },

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Retries towards a peer were exhausted.
    #[error("connection to rank {peer} failed after {attempts} attempts: {reason}")]
    Connectivity {
        peer: Rank,
        attempts: u32,
        reason: String,
    },

    /// A blocking operation hit its deadline.
    #[error("{op} on channel to rank {peer} timed out after {after:?}")]
    Timeout {
        op: &'static str,
        peer: Rank,
        after: Duration,
    },

    /// The channel is closed; every further operation fails fast.
    #[error("channel to rank {peer} is closed")]
    ChannelClosed { peer: Rank },

    /// The context has been shut down.
    #[error("context is closed")]
    ContextClosed,

    /// Inbound traffic that breaks the link protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Envelope could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// True for errors meaning the peer is unreachable, as opposed to slow.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::Connectivity { .. } | Error::ChannelClosed { .. } | Error::Transport(_)
        )
    }

    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::InvalidTopology { .. } | Error::InvalidRank { .. } | Error::Config(_)
        )
    }
}

/// Errors reported by a transport backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("connection to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("failed to listen on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("connection closed")]
    Closed,

    #[error("frame of {len} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("operation timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let timeout = Error::Timeout {
            op: "recv",
            peer: 1,
            after: Duration::from_millis(5),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_connectivity());

        let broken = Error::Connectivity {
            peer: 2,
            attempts: 3,
            reason: "reset".into(),
        };
        assert!(broken.is_connectivity());
        assert!(!broken.is_timeout());

        let cfg = Error::InvalidTopology {
            self_rank: 3,
            world_size: 3,
        };
        assert!(cfg.is_config());
        assert_eq!(cfg.to_string(), "invalid self rank=3, world_size=3");
    }
}
