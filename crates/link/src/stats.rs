//! Traffic counters.
//!
//! Channels and the receiver loop keep plain atomics and mirror each update
//! into the `metrics` facade; snapshots are what callers get to see.

use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};

use corelib::Rank;
use serde::Serialize;

/// Payload traffic of one channel.
#[derive(Debug, Default)]
pub struct ChannelStats {
    sent_bytes: AtomicU64,
    sent_messages: AtomicU64,
    recv_bytes: AtomicU64,
    recv_messages: AtomicU64,
}

impl ChannelStats {
    pub(crate) fn record_send(&self, peer: Rank, bytes: usize) {
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("link_sent_bytes_total", "peer" => peer.to_string())
            .increment(bytes as u64);
    }

    pub(crate) fn record_recv(&self, peer: Rank, bytes: usize) {
        self.recv_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.recv_messages.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("link_recv_bytes_total", "peer" => peer.to_string())
            .increment(bytes as u64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            recv_messages: self.recv_messages.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sent_bytes: u64,
    pub sent_messages: u64,
    pub recv_bytes: u64,
    pub recv_messages: u64,
}

impl Add for StatsSnapshot {
    type Output = StatsSnapshot;

    fn add(self, other: StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            sent_bytes: self.sent_bytes + other.sent_bytes,
            sent_messages: self.sent_messages + other.sent_messages,
            recv_bytes: self.recv_bytes + other.recv_bytes,
            recv_messages: self.recv_messages + other.recv_messages,
        }
    }
}

/// What the receiver loop did with inbound frames.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    delivered: AtomicU64,
    malformed: AtomicU64,
    unregistered: AtomicU64,
    misrouted: AtomicU64,
}

impl ReceiverStats {
    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("link_inbound_rejected_total", "reason" => "malformed").increment(1);
    }

    pub(crate) fn record_unregistered(&self) {
        self.unregistered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("link_inbound_rejected_total", "reason" => "unregistered").increment(1);
    }

    pub(crate) fn record_misrouted(&self) {
        self.misrouted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("link_inbound_rejected_total", "reason" => "misrouted").increment(1);
    }

    pub fn snapshot(&self) -> ReceiverSnapshot {
        ReceiverSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unregistered: self.unregistered.load(Ordering::Relaxed),
            misrouted: self.misrouted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverSnapshot {
    pub delivered: u64,
    /// Frames that did not decode as an envelope.
    pub malformed: u64,
    /// Envelopes from a rank with no registered channel.
    pub unregistered: u64,
    /// Envelopes addressed to a different rank.
    pub misrouted: u64,
}

impl ReceiverSnapshot {
    pub fn rejected(&self) -> u64 {
        self.malformed + self.unregistered + self.misrouted
    }
}
