//! Link-level message envelope.
//!
//! Every frame handed to a transport carries exactly one envelope. Data
//! envelopes hold a sequence number that is monotonic per (sender, receiver)
//! pair; the receiving channel uses it to restore send order. Payloads larger
//! than the payload limit travel as several chunk envelopes with contiguous
//! sequence numbers.
//!
//! ```text
//! Envelope { sender, receiver, seq, body }
//!   body = Data { key, chunk: index/count, payload }
//!        | Ack  { bytes }
//!        | Handshake
//! ```
//!
//! The encoding is bincode; framing is the transport's job.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::party::Rank;

/// Longest key a data envelope may carry.
pub const MAX_KEY_LEN: usize = 1024;

/// Upper bound of the encoded envelope size beyond its payload bytes.
pub const ENVELOPE_OVERHEAD: usize = 256 + MAX_KEY_LEN;

/// Largest frame an envelope with at most `payload_limit` payload bytes
/// encodes to.
pub fn max_frame_size(payload_limit: usize) -> usize {
    payload_limit.saturating_add(ENVELOPE_OVERHEAD)
}

/// Position of a chunk within its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub count: u32,
}

impl Chunk {
    pub const WHOLE: Chunk = Chunk { index: 0, count: 1 };

    pub fn is_last(&self) -> bool {
        self.index + 1 >= self.count
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    /// A payload, or one chunk of it, published under `key`.
    Data {
        key: String,
        chunk: Chunk,
        payload: Vec<u8>,
    },
    /// The receiver consumed `bytes` of payload; releases sender window.
    Ack { bytes: u64 },
    /// Mesh connectivity check.
    Handshake,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Rank,
    pub receiver: Rank,
    /// Meaningful for `Data` only; control envelopes carry 0.
    pub seq: u64,
    pub body: Body,
}

impl Envelope {
    pub fn data(
        sender: Rank,
        receiver: Rank,
        seq: u64,
        key: &str,
        chunk: Chunk,
        payload: &[u8],
    ) -> Self {
        Self {
            sender,
            receiver,
            seq,
            body: Body::Data {
                key: key.to_string(),
                chunk,
                payload: payload.to_vec(),
            },
        }
    }

    pub fn ack(sender: Rank, receiver: Rank, bytes: u64) -> Self {
        Self {
            sender,
            receiver,
            seq: 0,
            body: Body::Ack { bytes },
        }
    }

    pub fn handshake(sender: Rank, receiver: Rank) -> Self {
        Self {
            sender,
            receiver,
            seq: 0,
            body: Body::Handshake,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| Error::Codec(e.to_string()))
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        bincode::deserialize(frame).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// Number of chunks needed for `len` bytes under `limit` bytes per chunk.
///
/// An empty payload still takes one chunk.
pub fn chunk_count(len: usize, limit: usize) -> usize {
    if len == 0 || limit == 0 {
        1
    } else {
        len.div_ceil(limit)
    }
}
