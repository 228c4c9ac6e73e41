//! Tunnel configuration surface
//!
//! Immutable after construction; injected into every component.

use std::time::Duration;
use thiserror::Error;

/// Settings validation errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("hop bounds invalid: min {min}, max {max} (allowed 1..=3)")]
    HopBounds { min: u8, max: u8 },
    #[error("pool bounds invalid: min {min}, max {max}")]
    PoolBounds { min: usize, max: usize },
    #[error("relay score must be in 0.0..=1.0: {0}")]
    RelayScore(f64),
}

/// Configuration consumed by the circuit engine
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Minimum hops per circuit
    pub min_hops: u8,
    /// Maximum hops per circuit
    pub max_hops: u8,
    /// Default hops when the pool builds circuits
    pub default_hops: u8,
    /// Lifetime after which a circuit is expired
    pub circuit_lifetime: Duration,
    /// Keepalive send interval
    pub heartbeat_interval: Duration,
    /// Silence beyond this fails the circuit
    pub heartbeat_timeout: Duration,
    /// CREATE/EXTEND response timeout
    pub response_timeout: Duration,
    /// Pool lower bound (warm standbys included)
    pub min_circuits: usize,
    /// Pool upper bound
    pub max_circuits: usize,
    /// Wait bound when the pool is exhausted
    pub acquire_timeout: Duration,
    /// Minimum relay reliability score
    pub min_relay_score: f64,
    /// Maximum acceptable relay RTT
    pub max_relay_rtt: Duration,
    /// Substitute-relay attempts per hop
    pub hop_retry_limit: u32,
    /// Datagram send retry attempts
    pub send_retry_limit: u32,
    /// Base delay for send retry backoff
    pub send_retry_base: Duration,
    /// Total bound on a handshake
    pub handshake_timeout: Duration,
    /// Health monitor sweep interval
    pub monitor_interval: Duration,
    /// Peer table capacity
    pub max_peers: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            min_hops: 1,
            max_hops: 3,
            default_hops: 2,
            circuit_lifetime: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(5),
            min_circuits: 2,
            max_circuits: 3,
            acquire_timeout: Duration::from_secs(30),
            min_relay_score: 0.5,
            max_relay_rtt: Duration::from_millis(1500),
            hop_retry_limit: 2,
            send_retry_limit: 3,
            send_retry_base: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(15),
            max_peers: 1024,
        }
    }
}

impl TunnelSettings {
    /// Validate bounds
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.min_hops < 1 || self.max_hops > 3 || self.min_hops > self.max_hops {
            return Err(SettingsError::HopBounds {
                min: self.min_hops,
                max: self.max_hops,
            });
        }
        if self.min_circuits == 0 || self.min_circuits > self.max_circuits {
            return Err(SettingsError::PoolBounds {
                min: self.min_circuits,
                max: self.max_circuits,
            });
        }
        if !(0.0..=1.0).contains(&self.min_relay_score) {
            return Err(SettingsError::RelayScore(self.min_relay_score));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(TunnelSettings::default().validate().is_ok());
    }

    #[test]
    fn test_bad_hop_bounds() {
        let settings = TunnelSettings {
            max_hops: 4,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::HopBounds { .. })
        ));
    }

    #[test]
    fn test_bad_pool_bounds() {
        let settings = TunnelSettings {
            min_circuits: 5,
            max_circuits: 3,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::PoolBounds { .. })
        ));
    }
}
