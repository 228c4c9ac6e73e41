//! veilpipe-net: anonymous multi-hop circuits over UDP
//!
//! This crate provides:
//! - UDP datagram transport with retry/backoff
//! - Signed introduction handshake with NAT hole punching
//! - Per-hop X25519 key agreement and layered encryption
//! - Circuit construction, relaying, heartbeats, and pooling

pub mod circuit;
pub mod crypto;
pub mod directory;
pub mod handshake;
pub mod manager;
pub mod monitor;
pub mod onion;
pub mod pool;
pub mod relay;
pub mod settings;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use circuit::{Circuit, CircuitError, CircuitState, CircuitStats, HopNode};
pub use directory::PeerTable;
pub use handshake::{HandshakeEngine, HandshakeError, PunctureStats};
pub use manager::{destroy_reason, CircuitEvent, CircuitManager};
pub use monitor::HealthMonitor;
pub use pool::{CircuitPool, PoolError, PooledCircuit};
pub use relay::{RelayNode, RelayStats};
pub use settings::{SettingsError, TunnelSettings};
pub use transport::{Datagram, TransportError, UdpTransport};
