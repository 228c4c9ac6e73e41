//! Configuration for veild

use clap::Parser;
use std::net::SocketAddrV4;
use std::time::Duration;
use veilpipe_core::identity::NetworkIdentity;
use veilpipe_net::settings::TunnelSettings;

/// veild - anonymous circuit daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "veild")]
#[command(about = "Anonymous multi-hop circuit daemon")]
pub struct Config {
    /// Listen address (IPv4)
    #[arg(short, long, default_value = "0.0.0.0:9460")]
    pub listen: SocketAddrV4,

    /// Bootstrap peers (comma-separated host:port)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<SocketAddrV4>,

    /// Identity seed, 64 hex chars (ephemeral identity when absent)
    #[arg(long, env = "VEILD_IDENTITY_SEED")]
    pub identity_seed: Option<String>,

    /// Relay circuits for other nodes
    #[arg(long)]
    pub relay: bool,

    /// Hops per circuit
    #[arg(long, default_value = "2")]
    pub hops: u8,

    /// Minimum pooled circuits kept warm
    #[arg(long, default_value = "2")]
    pub min_circuits: usize,

    /// Maximum concurrent circuits
    #[arg(long, default_value = "3")]
    pub max_circuits: usize,

    /// Circuit lifetime in seconds
    #[arg(long, default_value = "600")]
    pub circuit_lifetime_secs: u64,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "10")]
    pub heartbeat_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=3).contains(&self.hops) {
            anyhow::bail!("hops must be between 1 and 3, got {}", self.hops);
        }
        if self.min_circuits == 0 || self.min_circuits > self.max_circuits {
            anyhow::bail!(
                "circuit pool bounds invalid: min {}, max {}",
                self.min_circuits,
                self.max_circuits
            );
        }
        if self.log_format != "pretty" && self.log_format != "json" {
            anyhow::bail!("log format must be 'pretty' or 'json', got {}", self.log_format);
        }
        if let Some(seed) = &self.identity_seed {
            let bytes = hex::decode(seed)
                .map_err(|e| anyhow::anyhow!("identity seed is not valid hex: {e}"))?;
            if bytes.len() != 32 {
                anyhow::bail!("identity seed must be 32 bytes, got {}", bytes.len());
            }
        }
        Ok(())
    }

    /// Node identity: deterministic from the seed, else freshly
    /// generated.
    pub fn identity(&self) -> anyhow::Result<NetworkIdentity> {
        match &self.identity_seed {
            Some(seed) => {
                let bytes = hex::decode(seed)?;
                let seed: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("identity seed must be 32 bytes"))?;
                Ok(NetworkIdentity::from_seed(&seed))
            }
            None => Ok(NetworkIdentity::generate()),
        }
    }

    /// Engine settings derived from the flags
    pub fn tunnel_settings(&self) -> TunnelSettings {
        TunnelSettings {
            default_hops: self.hops,
            min_circuits: self.min_circuits,
            max_circuits: self.max_circuits,
            circuit_lifetime: Duration::from_secs(self.circuit_lifetime_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            ..Default::default()
        }
    }
}
