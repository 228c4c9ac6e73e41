//! Peer identity and reliability tracking

use serde::{Deserialize, Serialize};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

/// Unique peer identifier: SHA-1 of the peer's Ed25519 public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Derive from an Ed25519 public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        use sha1::{Digest, Sha1};
        let digest = Sha1::digest(public_key);
        let mut id = [0u8; 20];
        id.copy_from_slice(&digest);
        Self(id)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Handshake progress with a peer
///
/// Transitions move strictly forward; the only backward edge is
/// `Failed -> None` on an explicit retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    /// No handshake attempted
    None,
    /// Introduction request sent, awaiting response
    IntroRequestSent,
    /// Introduction response received and verified
    IntroResponseReceived,
    /// Puncture request sent to the intermediary
    PunctureRequestSent,
    /// Puncture received from the NATed peer
    PunctureReceived,
    /// Peer is reachable and signature-verified
    Complete,
    /// Handshake failed (timeout, version mismatch)
    Failed,
}

impl HandshakeState {
    fn rank(self) -> u8 {
        match self {
            Self::None => 0,
            Self::IntroRequestSent => 1,
            Self::IntroResponseReceived => 2,
            Self::PunctureRequestSent => 3,
            Self::PunctureReceived => 4,
            Self::Complete => 5,
            Self::Failed => 6,
        }
    }

    /// Whether moving to `next` is a legal forward transition
    pub fn can_advance_to(self, next: HandshakeState) -> bool {
        if self == Self::Failed {
            return next == Self::None;
        }
        next.rank() > self.rank()
    }
}

/// Smoothed round-trip estimate (RFC 6298 style EWMA)
#[derive(Clone, Copy, Debug, Default)]
pub struct RttEstimate {
    /// Smoothed RTT in milliseconds
    pub srtt_ms: f64,
    /// RTT variance in milliseconds
    pub rttvar_ms: f64,
    samples: u32,
}

impl RttEstimate {
    const ALPHA: f64 = 0.125;
    const BETA: f64 = 0.25;

    /// Fold in a new sample
    pub fn update(&mut self, rtt: Duration) {
        let ms = rtt.as_secs_f64() * 1000.0;
        if self.samples == 0 {
            self.srtt_ms = ms;
            self.rttvar_ms = ms / 2.0;
        } else {
            self.rttvar_ms =
                (1.0 - Self::BETA) * self.rttvar_ms + Self::BETA * (self.srtt_ms - ms).abs();
            self.srtt_ms = (1.0 - Self::ALPHA) * self.srtt_ms + Self::ALPHA * ms;
        }
        self.samples += 1;
    }

    /// Number of samples folded in
    pub fn samples(&self) -> u32 {
        self.samples
    }
}

/// A remote node in the overlay
#[derive(Clone, Debug)]
pub struct Peer {
    /// Ed25519 public key
    pub public_key: [u8; 32],
    /// Derived identifier
    pub peer_id: PeerId,
    /// IPv4 address and port
    pub addr: SocketAddrV4,
    /// Handshake progress
    pub handshake: HandshakeState,
    /// Successful handshake/circuit steps
    pub successes: u32,
    /// Failed handshake/circuit steps
    pub failures: u32,
    /// Round-trip estimate
    pub rtt: RttEstimate,
    /// Eligible to serve as a circuit hop
    pub relay_candidate: bool,
    /// Protocol version the peer reported
    pub version: u16,
    /// Last time we heard from the peer
    pub last_seen: Instant,
}

impl Peer {
    /// Register a newly discovered peer
    pub fn new(public_key: [u8; 32], addr: SocketAddrV4) -> Self {
        Self {
            public_key,
            peer_id: PeerId::from_public_key(&public_key),
            addr,
            handshake: HandshakeState::None,
            successes: 0,
            failures: 0,
            rtt: RttEstimate::default(),
            relay_candidate: true,
            version: 0,
            last_seen: Instant::now(),
        }
    }

    /// Record a successful step, optionally with an RTT sample
    pub fn record_success(&mut self, rtt: Option<Duration>) {
        self.successes = self.successes.saturating_add(1);
        if let Some(rtt) = rtt {
            self.rtt.update(rtt);
        }
        self.last_seen = Instant::now();
    }

    /// Record a failed step
    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    /// Reliability score in `0.0..=1.0` (Laplace-smoothed success ratio)
    pub fn reliability_score(&self) -> f64 {
        (self.successes as f64 + 1.0) / ((self.successes + self.failures) as f64 + 2.0)
    }

    /// Whether the four-message handshake completed
    pub fn is_handshake_complete(&self) -> bool {
        self.handshake == HandshakeState::Complete
    }
}
