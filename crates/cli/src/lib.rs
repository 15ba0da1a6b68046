//! Command-line front end for the communication mesh.
//!
//! One invocation runs one party: it reads the shared topology descriptor,
//! builds a context for `--rank` and runs a command against the mesh:
//! - Validating a descriptor without touching the network
//! - Joining the mesh
//! - Measuring round-trip latency to every peer
//! - Benchmarking ring throughput

pub mod commands;
pub mod config;

pub use commands::{Command, CommandResult};
pub use config::CliConfig;
