//! Subcommands and their results.

use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::Subcommand;
use corelib::{Rank, TopologyDescriptor};
use link::{Context, ContextFactory, StatsSnapshot};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve the descriptor for this rank without touching the network.
    Validate,
    /// Join the mesh: exchange a handshake with every peer, then leave.
    Connect,
    /// Measure round-trip latency to every peer.
    Ping {
        #[arg(long, default_value_t = 10)]
        rounds: usize,
    },
    /// Pass payloads around the ring of ranks and report throughput.
    Bench {
        /// Payload size in bytes.
        #[arg(long, default_value_t = 1 << 20)]
        size: usize,
        #[arg(long, default_value_t = 16)]
        rounds: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerLatency {
    pub peer: Rank,
    pub min_us: u64,
    pub mean_us: u64,
    pub max_us: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandResult {
    Validated {
        id: String,
        rank: Rank,
        world_size: usize,
        protocol: &'static str,
        connection_type: &'static str,
        payload_limit: usize,
        stream_window: Option<u32>,
        throttle_window: u64,
        tls: bool,
    },
    Connected {
        id: String,
        rank: Rank,
        world_size: usize,
        local_addr: String,
    },
    Ping {
        rank: Rank,
        rounds: usize,
        peers: Vec<PeerLatency>,
    },
    Bench {
        rank: Rank,
        size: usize,
        rounds: usize,
        elapsed_ms: u64,
        throughput_mib_s: f64,
        stats: StatsSnapshot,
    },
}

impl Command {
    pub async fn execute(
        &self,
        desc: &TopologyDescriptor,
        rank: Rank,
    ) -> anyhow::Result<CommandResult> {
        if let Command::Validate = self {
            let settings = desc.validate(rank)?;
            return Ok(CommandResult::Validated {
                id: settings.id,
                rank,
                world_size: settings.world_size,
                protocol: settings.protocol.as_str(),
                connection_type: settings.connection_type.as_str(),
                payload_limit: settings.payload_limit,
                stream_window: settings.stream_window,
                throttle_window: settings.throttle_window,
                tls: settings.tls.is_some(),
            });
        }

        let ctx = ContextFactory::new().create_context(desc, rank).await?;
        ctx.connect_to_mesh().await?;
        let result = self.run_on(&ctx).await;
        ctx.close().await;
        result
    }

    async fn run_on(&self, ctx: &Context) -> anyhow::Result<CommandResult> {
        match *self {
            Command::Validate | Command::Connect => Ok(CommandResult::Connected {
                id: ctx.id().to_string(),
                rank: ctx.rank(),
                world_size: ctx.world_size(),
                local_addr: ctx.local_addr().to_string(),
            }),
            Command::Ping { rounds } => ping(ctx, rounds).await,
            Command::Bench { size, rounds } => bench(ctx, size, rounds).await,
        }
    }
}

/// Every party pings every peer; the exchange is symmetric, so both ends
/// send before they receive.
async fn ping(ctx: &Context, rounds: usize) -> anyhow::Result<CommandResult> {
    let mut peers = Vec::with_capacity(ctx.channel_count());
    for channel in ctx.channels() {
        let mut samples = Vec::with_capacity(rounds);
        for round in 0..rounds {
            let key = format!("ping:{round}");
            let started = Instant::now();
            channel.send(&key, Bytes::from_static(b"ping")).await?;
            channel.recv(&key).await?;
            samples.push(started.elapsed());
        }
        peers.push(summarize(channel.peer_rank(), &samples));
    }
    Ok(CommandResult::Ping {
        rank: ctx.rank(),
        rounds,
        peers,
    })
}

fn summarize(peer: Rank, samples: &[Duration]) -> PeerLatency {
    let micros: Vec<u64> = samples.iter().map(|d| d.as_micros() as u64).collect();
    let total: u64 = micros.iter().sum();
    PeerLatency {
        peer,
        min_us: micros.iter().copied().min().unwrap_or(0),
        mean_us: total / micros.len().max(1) as u64,
        max_us: micros.iter().copied().max().unwrap_or(0),
    }
}

async fn bench(ctx: &Context, size: usize, rounds: usize) -> anyhow::Result<CommandResult> {
    let payload = Bytes::from(vec![0xa5; size]);
    let next = ctx.next_rank(1);
    let prev = ctx.prev_rank(1);

    let started = Instant::now();
    for round in 0..rounds {
        let key = format!("bench:{round}");
        let (sent, received) =
            tokio::join!(ctx.send(next, &key, payload.clone()), ctx.recv(prev, &key));
        sent?;
        let received = received?;
        anyhow::ensure!(
            received.len() == size,
            "round {round}: got {} bytes from rank {prev}, expected {size}",
            received.len()
        );
    }
    let elapsed = started.elapsed();

    let mib = (size * rounds) as f64 / (1024.0 * 1024.0);
    let throughput_mib_s = mib / elapsed.as_secs_f64().max(f64::EPSILON);
    info!(rank = ctx.rank(), size, rounds, throughput_mib_s, "bench finished");
    Ok(CommandResult::Bench {
        rank: ctx.rank(),
        size,
        rounds,
        elapsed_ms: elapsed.as_millis() as u64,
        throughput_mib_s,
        stats: ctx.stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::topology::TlsOptions;

    #[tokio::test]
    async fn test_validate_reports_resolved_settings() {
        let desc = TopologyDescriptor::new(["127.0.0.1:1", "127.0.0.1:2"])
            .with_protocol("quic")
            .with_max_payload_size(65536)
            .with_tls(
                TlsOptions {
                    ca_path: Some("ca.pem".into()),
                    ..Default::default()
                },
                TlsOptions {
                    cert_path: Some("cert.pem".into()),
                    key_path: Some("key.pem".into()),
                    ..Default::default()
                },
            );
        let result = Command::Validate.execute(&desc, 1).await.unwrap();
        match result {
            CommandResult::Validated {
                rank,
                payload_limit,
                stream_window,
                protocol,
                tls,
                ..
            } => {
                assert_eq!(rank, 1);
                assert!(tls);
                assert_eq!(protocol, "quic");
                assert_eq!(payload_limit, 61440);
                assert_eq!(stream_window, Some(65536));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_validate_rejects_rank_outside_topology() {
        let desc = TopologyDescriptor::new(["127.0.0.1:1"]);
        assert!(Command::Validate.execute(&desc, 1).await.is_err());
    }

    #[test]
    fn test_summarize() {
        let samples = [
            Duration::from_micros(10),
            Duration::from_micros(30),
            Duration::from_micros(20),
        ];
        let latency = summarize(3, &samples);
        assert_eq!(latency.peer, 3);
        assert_eq!(latency.min_us, 10);
        assert_eq!(latency.mean_us, 20);
        assert_eq!(latency.max_us, 30);
    }

    #[test]
    fn test_result_is_tagged_json() {
        let json = serde_json::to_value(CommandResult::Connected {
            id: "root".into(),
            rank: 0,
            world_size: 2,
            local_addr: "127.0.0.1:9000".into(),
        })
        .unwrap();
        assert_eq!(json["command"], "connected");
        assert_eq!(json["world_size"], 2);
    }
}
