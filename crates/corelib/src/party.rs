//! Party abstractions for the communication mesh.
//!
//! A party is one process taking part in a multi-party protocol run. Parties
//! are addressed by their `Rank`, which is also their index in the topology.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a party within a fixed-size topology.
pub type Rank = usize;

/// One participant of the mesh.
///
/// Keep this struct small and cheap to clone; connection state lives in the
/// channels of a context, never here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub rank: Rank,
    /// Address the party listens on, `host:port`.
    pub host: String,
}

impl Party {
    pub fn new(rank: Rank, host: impl Into<String>) -> Self {
        Self {
            rank,
            host: host.into(),
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank {}@{}", self.rank, self.host)
    }
}
