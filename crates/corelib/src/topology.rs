//! Topology descriptors and their validation.
//!
//! A [`TopologyDescriptor`] is created once per protocol run, typically
//! deserialized from a file shared by every party, and is read-only
//! afterwards. [`TopologyDescriptor::validate`] turns it into the resolved
//! [`LinkSettings`] for one rank, failing before any network resource is
//! touched.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::error::{Error, Result};
use crate::party::{Party, Rank};

/// Bytes reserved for framing headers on stream-multiplexed transports.
pub const STREAM_HEADER_RESERVE: usize = 4096;

/// Exclusive upper bound of `max_payload_size` on stream-multiplexed transports.
pub const MAX_STREAM_WINDOW: usize = i32::MAX as usize;

/// Transport class selected by the descriptor's `transport_protocol` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    /// One framed byte stream per connection.
    Tcp,
    /// Stream-multiplexed connections with per-stream flow control.
    Quic,
}

impl TransportProtocol {
    pub fn is_stream_multiplexed(self) -> bool {
        matches!(self, TransportProtocol::Quic)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Quic => "quic",
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportProtocol::Tcp),
            "quic" => Ok(TransportProtocol::Quic),
            other => Err(Error::Config(format!(
                "unknown transport_protocol {other:?}, expected \"tcp\" or \"quic\""
            ))),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a channel manages its outbound connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    /// One persistent connection.
    #[default]
    Single,
    /// Up to `pool_size` persistent connections used round-robin.
    Pooled,
    /// A fresh connection for every frame.
    Short,
}

impl ConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Single => "single",
            ConnectionType::Pooled => "pooled",
            ConnectionType::Short => "short",
        }
    }
}

impl FromStr for ConnectionType {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(ConnectionType::Single),
            "pooled" => Ok(ConnectionType::Pooled),
            "short" => Ok(ConnectionType::Short),
            other => Err(Error::Config(format!(
                "unknown connection_type {other:?}, expected single, pooled or short"
            ))),
        }
    }
}

/// PEM material for one side of a TLS session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Certificate chain presented to the other side.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Roots used to verify the other side.
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    /// Name checked against the server certificate; defaults to the host part
    /// of the peer address.
    #[serde(default)]
    pub server_name: Option<String>,
}

impl TlsOptions {
    fn validate_client(&self) -> Result<()> {
        if self.ca_path.is_none() {
            return Err(Error::Config("client_tls requires ca_path".into()));
        }
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(Error::Config(
                "client_tls cert_path and key_path must be set together".into(),
            ));
        }
        Ok(())
    }

    fn validate_server(&self) -> Result<()> {
        if self.cert_path.is_none() || self.key_path.is_none() {
            return Err(Error::Config(
                "server_tls requires cert_path and key_path".into(),
            ));
        }
        Ok(())
    }
}

/// Bounded reconnect policy with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_backoff_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis(delay.min(self.max_backoff_ms as f64) as u64)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if !(self.multiplier >= 1.0) {
            return Err(Error::Config("retry.multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}

/// Explicit log verbosity of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl Verbosity {
    /// True if messages at `level` should be emitted.
    pub fn enabled(self, level: Verbosity) -> bool {
        level <= self
    }

    pub fn level_filter(self) -> LevelFilter {
        match self {
            Verbosity::Error => LevelFilter::ERROR,
            Verbosity::Warn => LevelFilter::WARN,
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Debug => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }
}

impl FromStr for Verbosity {
    type Err = Error;

    fn from_str(level: &str) -> Result<Self> {
        match level.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Verbosity::Error),
            "warn" => Ok(Verbosity::Warn),
            "info" => Ok(Verbosity::Info),
            "debug" => Ok(Verbosity::Debug),
            "trace" => Ok(Verbosity::Trace),
            other => Err(Error::Config(format!("unknown verbosity {other:?}"))),
        }
    }
}

fn default_id() -> String {
    "root".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}

fn default_recv_timeout_ms() -> u64 {
    30_000
}

fn default_max_payload_size() -> usize {
    1024 * 1024
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_pool_size() -> usize {
    4
}

/// Description of one protocol run's mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyDescriptor {
    #[serde(default = "default_id")]
    pub id: String,
    /// Ordered party list; index = rank.
    pub parties: Vec<Party>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
    #[serde(default = "default_protocol")]
    pub transport_protocol: String,
    #[serde(default)]
    pub connection_type: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub enable_ssl: bool,
    #[serde(default)]
    pub client_tls: Option<TlsOptions>,
    #[serde(default)]
    pub server_tls: Option<TlsOptions>,
    /// Flow-control cap in bytes; 0 means unbounded.
    #[serde(default)]
    pub throttle_window_size: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub verbosity: Verbosity,
}

impl TopologyDescriptor {
    /// Descriptor with default settings for the given hosts, ranked in order.
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: default_id(),
            parties: hosts
                .into_iter()
                .enumerate()
                .map(|(rank, host)| Party::new(rank, host))
                .collect(),
            connect_timeout_ms: default_connect_timeout_ms(),
            recv_timeout_ms: default_recv_timeout_ms(),
            max_payload_size: default_max_payload_size(),
            transport_protocol: default_protocol(),
            connection_type: None,
            pool_size: default_pool_size(),
            enable_ssl: false,
            client_tls: None,
            server_tls: None,
            throttle_window_size: 0,
            retry: RetryPolicy::default(),
            verbosity: Verbosity::default(),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.transport_protocol = protocol.into();
        self
    }

    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn with_throttle_window(mut self, bytes: u64) -> Self {
        self.throttle_window_size = bytes;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, recv: Duration) -> Self {
        self.connect_timeout_ms = connect.as_millis() as u64;
        self.recv_timeout_ms = recv.as_millis() as u64;
        self
    }

    pub fn with_connection_type(mut self, kind: impl Into<String>) -> Self {
        self.connection_type = Some(kind.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tls(mut self, client: TlsOptions, server: TlsOptions) -> Self {
        self.enable_ssl = true;
        self.client_tls = Some(client);
        self.server_tls = Some(server);
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn world_size(&self) -> usize {
        self.parties.len()
    }

    /// Checks the descriptor for `self_rank` and resolves every setting a
    /// context needs.
    pub fn validate(&self, self_rank: Rank) -> Result<LinkSettings> {
        let world_size = self.world_size();
        if self_rank >= world_size {
            return Err(Error::InvalidTopology {
                self_rank,
                world_size,
            });
        }
        if self.id.is_empty() {
            return Err(Error::Config("id must not be empty".into()));
        }
        for (index, party) in self.parties.iter().enumerate() {
            if party.rank != index {
                return Err(Error::Config(format!(
                    "party at index {index} declares rank {}",
                    party.rank
                )));
            }
            if party.host.trim().is_empty() {
                return Err(Error::Config(format!("party {index} has an empty host")));
            }
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::Config("connect_timeout_ms must be > 0".into()));
        }
        if self.recv_timeout_ms == 0 {
            return Err(Error::Config("recv_timeout_ms must be > 0".into()));
        }

        let protocol: TransportProtocol = self.transport_protocol.parse()?;
        let connection_type = match &self.connection_type {
            Some(tag) if !tag.is_empty() => tag.parse()?,
            _ => ConnectionType::default(),
        };
        if connection_type == ConnectionType::Pooled && self.pool_size == 0 {
            return Err(Error::Config("pool_size must be >= 1".into()));
        }
        self.retry.validate()?;

        let (payload_limit, stream_window) = if protocol.is_stream_multiplexed() {
            if self.max_payload_size <= STREAM_HEADER_RESERVE {
                return Err(Error::Config(format!(
                    "max_payload_size={} is too small, must be > {STREAM_HEADER_RESERVE}",
                    self.max_payload_size
                )));
            }
            if self.max_payload_size >= MAX_STREAM_WINDOW {
                return Err(Error::Config(format!(
                    "max_payload_size={} is too large, must be < {MAX_STREAM_WINDOW}",
                    self.max_payload_size
                )));
            }
            // The transport window carries the raw value, the application
            // limit leaves room for headers.
            (
                self.max_payload_size - STREAM_HEADER_RESERVE,
                Some(self.max_payload_size as u32),
            )
        } else {
            if self.max_payload_size == 0 {
                return Err(Error::Config("max_payload_size must be > 0".into()));
            }
            (self.max_payload_size, None)
        };

        let tls = if self.enable_ssl {
            let client = self
                .client_tls
                .clone()
                .ok_or_else(|| Error::Config("enable_ssl requires client_tls".into()))?;
            let server = self
                .server_tls
                .clone()
                .ok_or_else(|| Error::Config("enable_ssl requires server_tls".into()))?;
            client.validate_client()?;
            server.validate_server()?;
            Some(TlsPair { client, server })
        } else {
            None
        };
        if protocol == TransportProtocol::Quic && tls.is_none() {
            return Err(Error::Config(
                "transport_protocol \"quic\" requires enable_ssl".into(),
            ));
        }

        Ok(LinkSettings {
            id: self.id.clone(),
            self_rank,
            world_size,
            protocol,
            connection_type,
            pool_size: match connection_type {
                ConnectionType::Pooled => self.pool_size,
                _ => 1,
            },
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            recv_timeout: Duration::from_millis(self.recv_timeout_ms),
            payload_limit,
            stream_window,
            throttle_window: self.throttle_window_size,
            retry: self.retry.clone(),
            tls,
            verbosity: self.verbosity,
        })
    }
}

/// Client and server TLS options, present only when encryption is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPair {
    pub client: TlsOptions,
    pub server: TlsOptions,
}

/// Validated settings of one context.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub id: String,
    pub self_rank: Rank,
    pub world_size: usize,
    pub protocol: TransportProtocol,
    pub connection_type: ConnectionType,
    /// Persistent connections per channel.
    pub pool_size: usize,
    pub connect_timeout: Duration,
    pub recv_timeout: Duration,
    /// Largest payload carried by one envelope.
    pub payload_limit: usize,
    /// Transport-level stream window, streaming class only.
    pub stream_window: Option<u32>,
    pub throttle_window: u64,
    pub retry: RetryPolicy,
    pub tls: Option<TlsPair>,
    pub verbosity: Verbosity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_parses_and_orders() {
        let level: Verbosity = " Debug ".parse().unwrap();
        assert_eq!(level, Verbosity::Debug);
        assert!(level.enabled(Verbosity::Info));
        assert!(!level.enabled(Verbosity::Trace));
        assert!("loud".parse::<Verbosity>().unwrap_err().is_config());
    }

    fn hosts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("127.0.0.1:{}", 9000 + i)).collect()
    }

    fn encrypted(desc: TopologyDescriptor) -> TopologyDescriptor {
        desc.with_tls(
            TlsOptions {
                ca_path: Some("ca.pem".into()),
                ..Default::default()
            },
            TlsOptions {
                cert_path: Some("cert.pem".into()),
                key_path: Some("key.pem".into()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_quic_requires_tls() {
        let plain = TopologyDescriptor::new(hosts(2)).with_protocol("quic");
        let err = plain.clone().validate(0).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("enable_ssl"));

        assert!(encrypted(plain).validate(0).is_ok());
    }

    #[test]
    fn test_rejects_rank_outside_world() {
        let desc = TopologyDescriptor::new(hosts(3));
        let err = desc.validate(3).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTopology {
                self_rank: 3,
                world_size: 3
            }
        ));
        assert!(err.to_string().contains("self rank=3"));
        assert!(err.to_string().contains("world_size=3"));
    }

    #[test]
    fn test_stream_payload_bounds() {
        let base = encrypted(TopologyDescriptor::new(hosts(2)).with_protocol("quic"));

        let small = base.clone().with_max_payload_size(4096);
        assert!(small.validate(0).unwrap_err().is_config());

        let large = base.clone().with_max_payload_size(1 << 31);
        assert!(large.validate(0).unwrap_err().is_config());

        let limit = base.clone().with_max_payload_size(i32::MAX as usize);
        assert!(limit.validate(0).is_err());

        let ok = base.with_max_payload_size(65536).validate(0).unwrap();
        assert_eq!(ok.payload_limit, 65536 - 4096);
        assert_eq!(ok.stream_window, Some(65536));
    }

    #[test]
    fn test_point_to_point_keeps_payload_limit() {
        let settings = TopologyDescriptor::new(hosts(2))
            .with_max_payload_size(100)
            .validate(1)
            .unwrap();
        assert_eq!(settings.payload_limit, 100);
        assert_eq!(settings.stream_window, None);
        assert_eq!(settings.connection_type, ConnectionType::Single);
        assert_eq!(settings.pool_size, 1);
    }

    #[test]
    fn test_tls_options_required_together() {
        let mut desc = TopologyDescriptor::new(hosts(2));
        desc.enable_ssl = true;
        desc.server_tls = Some(TlsOptions {
            cert_path: Some("cert.pem".into()),
            key_path: Some("key.pem".into()),
            ..Default::default()
        });
        assert!(desc.validate(0).unwrap_err().is_config());

        desc.client_tls = Some(TlsOptions {
            ca_path: Some("ca.pem".into()),
            ..Default::default()
        });
        let settings = desc.validate(0).unwrap();
        assert!(settings.tls.is_some());
    }

    #[test]
    fn test_party_rank_must_match_index() {
        let mut desc = TopologyDescriptor::new(hosts(3));
        desc.parties[2].rank = 7;
        assert!(desc.validate(0).unwrap_err().is_config());
    }

    #[test]
    fn test_unknown_tags_rejected() {
        let desc = TopologyDescriptor::new(hosts(2)).with_protocol("carrier-pigeon");
        assert!(desc.validate(0).is_err());

        let desc = TopologyDescriptor::new(hosts(2)).with_connection_type("sometimes");
        assert!(desc.validate(0).is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut desc = TopologyDescriptor::new(hosts(2));
        desc.recv_timeout_ms = 0;
        assert!(desc.validate(0).is_err());
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let retry = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
            multiplier: 2.0,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(300));
        assert_eq!(retry.backoff(30), Duration::from_millis(300));
    }

    #[test]
    fn test_descriptor_from_json_uses_defaults() {
        let json = r#"{
            "parties": [
                {"rank": 0, "host": "127.0.0.1:9100"},
                {"rank": 1, "host": "127.0.0.1:9101"}
            ],
            "connection_type": "pooled",
            "verbosity": "debug"
        }"#;
        let desc: TopologyDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(desc.id, "root");
        assert_eq!(desc.recv_timeout_ms, 30_000);
        assert_eq!(desc.throttle_window_size, 0);

        let settings = desc.validate(1).unwrap();
        assert_eq!(settings.connection_type, ConnectionType::Pooled);
        assert_eq!(settings.pool_size, 4);
        assert!(settings.verbosity.enabled(Verbosity::Debug));
        assert!(!settings.verbosity.enabled(Verbosity::Trace));
    }

    #[test]
    fn test_negative_rank_does_not_parse() {
        let json = r#"{"parties": [{"rank": -1, "host": "127.0.0.1:1"}]}"#;
        assert!(serde_json::from_str::<TopologyDescriptor>(json).is_err());
    }
}
