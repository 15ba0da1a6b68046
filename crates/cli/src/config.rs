//! Command-line arguments and process setup.

use std::fs;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use corelib::{Rank, TopologyDescriptor, Verbosity};
use tracing::debug;

use crate::commands::Command;

#[derive(Debug, Parser)]
#[command(name = "meshlink", version, about = "Run one party of a rank-addressed mesh")]
pub struct CliConfig {
    /// Topology descriptor shared by every party (JSON).
    #[arg(short, long, value_name = "FILE")]
    pub topology: PathBuf,

    /// Rank of this party within the topology.
    #[arg(short, long)]
    pub rank: Rank,

    /// Overrides the descriptor's verbosity (error, warn, info, debug, trace).
    #[arg(short, long)]
    pub verbosity: Option<Verbosity>,

    #[command(subcommand)]
    pub command: Command,
}

impl CliConfig {
    pub fn load_topology(&self) -> anyhow::Result<TopologyDescriptor> {
        let raw = fs::read_to_string(&self.topology)
            .with_context(|| format!("reading {}", self.topology.display()))?;
        let mut desc: TopologyDescriptor = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", self.topology.display()))?;
        if let Some(verbosity) = self.verbosity {
            desc.verbosity = verbosity;
        }
        Ok(desc)
    }

    pub fn run(self) -> anyhow::Result<()> {
        let desc = self.load_topology()?;
        init_tracing(desc.verbosity);
        debug!(topology = %self.topology.display(), rank = self.rank, "loaded topology");

        let runtime = tokio::runtime::Runtime::new().context("starting the async runtime")?;
        let result = runtime.block_on(self.command.execute(&desc, self.rank))?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        Ok(())
    }
}

fn init_tracing(verbosity: Verbosity) {
    // A subscriber may already be installed when embedded; keep it.
    let _ = tracing_subscriber::fmt()
        .with_max_level(verbosity.level_filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        CliConfig::command().debug_assert();
    }

    #[test]
    fn test_parses_bench_arguments() {
        let config = CliConfig::parse_from([
            "meshlink", "--topology", "mesh.json", "--rank", "2", "-v", "debug", "bench",
            "--size", "4096", "--rounds", "3",
        ]);
        assert_eq!(config.rank, 2);
        assert_eq!(config.verbosity, Some(Verbosity::Debug));
        assert!(matches!(
            config.command,
            Command::Bench {
                size: 4096,
                rounds: 3
            }
        ));
    }

    #[test]
    fn test_verbosity_override_applies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.json");
        fs::write(
            &path,
            r#"{"parties": [{"rank": 0, "host": "a:1"}, {"rank": 1, "host": "b:1"}]}"#,
        )
        .unwrap();

        let config = CliConfig::parse_from([
            "meshlink",
            "--topology",
            path.to_str().unwrap(),
            "--rank",
            "0",
            "-v",
            "trace",
            "validate",
        ]);
        let desc = config.load_topology().unwrap();
        assert_eq!(desc.verbosity, Verbosity::Trace);
        assert_eq!(desc.id, "root");
        assert_eq!(desc.world_size(), 2);
    }
}
