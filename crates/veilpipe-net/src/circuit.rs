//! Circuit state machine and hop ownership
//!
//! A circuit owns an ordered sequence of 1-3 hops (index 0 nearest the
//! local node). Hops may only be appended while the circuit is still
//! being built, establishment requires the full target count, and the
//! encryption entry points refuse anything that is not established and
//! unexpired.

use crate::crypto::{CryptoError, HopKey};
use crate::onion::{self, OnionError};
use crate::transport::TransportError;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};
use thiserror::Error;
use veilpipe_core::peer::PeerId;

/// Circuit errors
#[derive(Debug, Error)]
pub enum CircuitError {
    #[error("hop count {0} outside allowed range")]
    InvalidHopCount(u8),
    #[error("insufficient relay candidates: need {needed}, have {available}")]
    InsufficientRelays { needed: usize, available: usize },
    #[error("circuit not found: {0}")]
    NotFound(u32),
    #[error("circuit is {actual:?}, operation requires {expected:?}")]
    InvalidState {
        expected: CircuitState,
        actual: CircuitState,
    },
    #[error("circuit already has its {0} hops")]
    TooManyHops(u8),
    #[error("cannot establish with {established}/{expected} hops")]
    NotReady { expected: u8, established: u8 },
    #[error("circuit expired")]
    Expired,
    #[error("invalid hop index {index} (circuit has {hops} hops)")]
    InvalidHopIndex { index: usize, hops: usize },
    #[error("circuit establishment failed: built {established} of {requested} hops")]
    EstablishmentFailed { requested: u8, established: u8 },
    #[error("hop key confirmation failed")]
    KeyConfirmation,
    #[error("onion error: {0}")]
    Onion(#[from] OnionError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Circuit lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// CREATE/EXTEND exchange in progress
    Creating,
    /// Full hop chain built, usable for traffic
    Established,
    /// Build or heartbeat failure
    Failed,
    /// Torn down
    Closed,
}

/// One hop of a circuit: the relay plus its derived symmetric key.
///
/// The ephemeral private key that produced `key` was consumed by the
/// Diffie-Hellman step before this node was constructed; only the
/// derived key persists, and it is zeroed when the hop is dropped.
#[derive(Debug)]
pub struct HopNode {
    /// Relay peer ID
    pub peer_id: PeerId,
    /// Relay Ed25519 public key
    pub public_key: [u8; 32],
    /// Relay address
    pub addr: SocketAddrV4,
    key: HopKey,
}

impl HopNode {
    pub fn new(peer_id: PeerId, public_key: [u8; 32], addr: SocketAddrV4, key: HopKey) -> Self {
        Self {
            peer_id,
            public_key,
            addr,
            key,
        }
    }

    pub(crate) fn key(&self) -> &HopKey {
        &self.key
    }
}

/// An onion circuit under construction or in use
#[derive(Debug)]
pub struct Circuit {
    id: u32,
    target_hops: u8,
    hops: Vec<HopNode>,
    state: CircuitState,
    created_at: Instant,
    expires_at: Instant,
    last_activity: Instant,
    bytes_up: u64,
    bytes_down: u64,
    packets_up: u64,
    packets_down: u64,
    rtt: Option<Duration>,
    error: Option<String>,
}

impl Circuit {
    /// Start a circuit in `Creating`
    pub fn new(id: u32, target_hops: u8, lifetime: Duration) -> Self {
        let now = Instant::now();
        Self {
            id,
            target_hops,
            hops: Vec::with_capacity(target_hops as usize),
            state: CircuitState::Creating,
            created_at: now,
            expires_at: now + lifetime,
            last_activity: now,
            bytes_up: 0,
            bytes_down: 0,
            packets_up: 0,
            packets_down: 0,
            rtt: None,
            error: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn target_hops(&self) -> u8 {
        self.target_hops
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Address of hop 0, where all circuit traffic enters the overlay
    pub fn first_hop_addr(&self) -> Option<SocketAddrV4> {
        self.hops.first().map(|h| h.addr)
    }

    /// Peer IDs of all hops, in order
    pub fn hop_peers(&self) -> Vec<PeerId> {
        self.hops.iter().map(|h| h.peer_id).collect()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    /// Healthy means usable: established and not expired
    pub fn is_healthy(&self) -> bool {
        self.state == CircuitState::Established && !self.is_expired()
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn set_rtt(&mut self, rtt: Duration) {
        self.rtt = Some(rtt);
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Time since the last heartbeat response or delivered payload
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Record liveness (PONG or inbound data)
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Append a hop. Only legal while `Creating` and under the target.
    pub fn add_hop(&mut self, hop: HopNode) -> Result<(), CircuitError> {
        if self.state != CircuitState::Creating {
            return Err(CircuitError::InvalidState {
                expected: CircuitState::Creating,
                actual: self.state,
            });
        }
        if self.hops.len() >= self.target_hops as usize {
            return Err(CircuitError::TooManyHops(self.target_hops));
        }
        self.hops.push(hop);
        Ok(())
    }

    /// Transition to `Established`; requires the full hop chain.
    pub fn mark_established(&mut self) -> Result<(), CircuitError> {
        if self.state != CircuitState::Creating {
            return Err(CircuitError::InvalidState {
                expected: CircuitState::Creating,
                actual: self.state,
            });
        }
        if self.hops.len() != self.target_hops as usize {
            return Err(CircuitError::NotReady {
                expected: self.target_hops,
                established: self.hops.len() as u8,
            });
        }
        self.state = CircuitState::Established;
        self.last_activity = Instant::now();
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.state = CircuitState::Failed;
        self.error = Some(reason.into());
    }

    /// Close and drop all hop keys (zeroed by HopKey's drop)
    pub fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.hops.clear();
    }

    fn ensure_usable(&self) -> Result<(), CircuitError> {
        if self.state != CircuitState::Established {
            return Err(CircuitError::InvalidState {
                expected: CircuitState::Established,
                actual: self.state,
            });
        }
        if self.is_expired() {
            return Err(CircuitError::Expired);
        }
        Ok(())
    }

    /// Onion-wrap outbound bytes, nearest hop outermost
    pub fn encrypt_layers(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CircuitError> {
        self.ensure_usable()?;
        let mut data = plaintext.to_vec();
        for hop in self.hops.iter().rev() {
            data = onion::encrypt_for_hop(hop.key(), &data)?;
        }
        self.bytes_up += plaintext.len() as u64;
        self.packets_up += 1;
        Ok(data)
    }

    /// Peel all layers off circuit-originated traffic
    pub fn decrypt_layers(&mut self, data: &[u8]) -> Result<Vec<u8>, CircuitError> {
        self.ensure_usable()?;
        let mut data = data.to_vec();
        for hop in &self.hops {
            data = onion::decrypt_from_hop(hop.key(), &data)?;
        }
        self.bytes_down += data.len() as u64;
        self.packets_down += 1;
        self.touch();
        Ok(data)
    }

    /// Single-layer encrypt for one hop, for relay-forwarding logic
    pub fn encrypt_for_hop(&self, index: usize, plaintext: &[u8]) -> Result<Vec<u8>, CircuitError> {
        self.ensure_usable()?;
        let hop = self.hops.get(index).ok_or(CircuitError::InvalidHopIndex {
            index,
            hops: self.hops.len(),
        })?;
        Ok(onion::encrypt_for_hop(hop.key(), plaintext)?)
    }

    /// Single-layer decrypt from one hop
    pub fn decrypt_from_hop(&self, index: usize, data: &[u8]) -> Result<Vec<u8>, CircuitError> {
        self.ensure_usable()?;
        let hop = self.hops.get(index).ok_or(CircuitError::InvalidHopIndex {
            index,
            hops: self.hops.len(),
        })?;
        Ok(onion::decrypt_from_hop(hop.key(), data)?)
    }

    /// Counter snapshot for observability
    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            id: self.id,
            hops: self.hops.len(),
            state: self.state,
            age: self.created_at.elapsed(),
            bytes_up: self.bytes_up,
            bytes_down: self.bytes_down,
            packets_up: self.packets_up,
            packets_down: self.packets_down,
            rtt: self.rtt,
        }
    }
}

/// Circuit counter snapshot
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub id: u32,
    pub hops: usize,
    pub state: CircuitState,
    pub age: Duration,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub packets_up: u64,
    pub packets_down: u64,
    pub rtt: Option<Duration>,
}
