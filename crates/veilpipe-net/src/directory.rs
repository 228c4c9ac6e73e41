//! Peer table and relay candidate selection
//!
//! Owns every known `Peer`; the handshake engine and the circuit
//! manager feed outcomes back into it. Relay candidates are filtered
//! by reliability/RTT thresholds; peers already placed in the circuit
//! are excluded by key and by IP.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::time::Duration;
use tracing::debug;
use veilpipe_core::peer::{HandshakeState, Peer, PeerId};

/// Concurrency-safe peer registry
pub struct PeerTable {
    peers: RwLock<HashMap<PeerId, Peer>>,
    max_peers: usize,
    min_relay_score: f64,
    max_relay_rtt: Duration,
}

impl PeerTable {
    pub fn new(max_peers: usize, min_relay_score: f64, max_relay_rtt: Duration) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_peers,
            min_relay_score,
            max_relay_rtt,
        }
    }

    /// Register a discovered peer; evicts the lowest-score peer when
    /// the table is full. Re-discovery refreshes the address.
    pub fn insert(&self, public_key: [u8; 32], addr: SocketAddrV4) -> PeerId {
        let peer = Peer::new(public_key, addr);
        let id = peer.peer_id;
        let mut peers = self.peers.write();

        if let Some(existing) = peers.get_mut(&id) {
            existing.addr = addr;
            return id;
        }

        if peers.len() >= self.max_peers {
            let evict = peers
                .values()
                .min_by(|a, b| {
                    a.reliability_score()
                        .partial_cmp(&b.reliability_score())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|p| p.peer_id);
            if let Some(evict_id) = evict {
                debug!("peer table full, evicting {}", evict_id);
                peers.remove(&evict_id);
            }
        }

        peers.insert(id, peer);
        id
    }

    /// Snapshot of one peer
    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().get(id).cloned()
    }

    /// Mutate one peer in place
    pub fn with_peer<R>(&self, id: &PeerId, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        self.peers.write().get_mut(id).map(f)
    }

    /// Relay candidates ordered by reliability desc, RTT asc.
    ///
    /// Only handshake-complete relay candidates above the score
    /// threshold and under the RTT ceiling qualify. `exclude` holds the
    /// hops already placed in the circuit: those peers and any peer on
    /// the same machine are out, so no circuit crosses one IP twice.
    /// Substitutes for the same slot may share an IP; only one of them
    /// is ever placed.
    pub fn relay_candidates(&self, count: usize, exclude: &[Peer]) -> Vec<Peer> {
        let peers = self.peers.read();
        let excluded_ids: HashSet<&PeerId> = exclude.iter().map(|p| &p.peer_id).collect();
        let excluded_ips: HashSet<_> = exclude.iter().map(|p| *p.addr.ip()).collect();

        let mut candidates: Vec<Peer> = peers
            .values()
            .filter(|p| {
                p.relay_candidate
                    && p.is_handshake_complete()
                    && !excluded_ids.contains(&p.peer_id)
                    && !excluded_ips.contains(p.addr.ip())
                    && p.reliability_score() >= self.min_relay_score
                    && (p.rtt.samples() == 0
                        || p.rtt.srtt_ms <= self.max_relay_rtt.as_secs_f64() * 1000.0)
            })
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            b.reliability_score()
                .partial_cmp(&a.reliability_score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.rtt
                        .srtt_ms
                        .partial_cmp(&b.rtt.srtt_ms)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });

        candidates.truncate(count);
        candidates
    }

    /// Feed a handshake/circuit step outcome into the peer's metrics
    pub fn report_outcome(&self, id: &PeerId, success: bool, rtt: Option<Duration>) {
        self.with_peer(id, |peer| {
            if success {
                peer.record_success(rtt);
            } else {
                peer.record_failure();
            }
        });
    }

    /// Mark a peer unreachable: handshake reset, removed from relay
    /// rotation until a fresh handshake completes.
    pub fn mark_unreachable(&self, id: &PeerId) {
        self.with_peer(id, |peer| {
            peer.handshake = HandshakeState::Failed;
            peer.record_failure();
        });
    }

    /// Permanently reject a peer (protocol version mismatch)
    pub fn reject(&self, id: &PeerId) {
        self.with_peer(id, |peer| {
            peer.handshake = HandshakeState::Failed;
            peer.relay_candidate = false;
        });
    }

    /// Addresses of handshake-complete peers, for candidate lists
    pub fn known_addresses(&self, count: usize) -> Vec<SocketAddrV4> {
        self.peers
            .read()
            .values()
            .filter(|p| p.is_handshake_complete())
            .take(count)
            .map(|p| p.addr)
            .collect()
    }

    /// Look up a peer by public key
    pub fn find_by_key(&self, public_key: &[u8; 32]) -> Option<Peer> {
        self.get(&PeerId::from_public_key(public_key))
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PeerTable {
        PeerTable::new(64, 0.5, Duration::from_millis(1500))
    }

    fn add_complete_peer(table: &PeerTable, seed: u8, successes: u32, rtt_ms: u64) -> PeerId {
        let addr: SocketAddrV4 = format!("10.0.{seed}.1:7000").parse().unwrap();
        let id = table.insert([seed; 32], addr);
        table.with_peer(&id, |p| {
            p.handshake = HandshakeState::Complete;
            for _ in 0..successes {
                p.record_success(Some(Duration::from_millis(rtt_ms)));
            }
        });
        id
    }

    #[test]
    fn test_candidates_require_complete_handshake() {
        let table = table();
        table.insert([1; 32], "10.0.0.1:7000".parse().unwrap());
        assert!(table.relay_candidates(3, &[]).is_empty());

        add_complete_peer(&table, 2, 5, 50);
        assert_eq!(table.relay_candidates(3, &[]).len(), 1);
    }

    #[test]
    fn test_candidates_ordered_by_reliability_then_rtt() {
        let table = table();
        let weak = add_complete_peer(&table, 1, 2, 40);
        let strong = add_complete_peer(&table, 2, 20, 40);
        let _ = weak;

        let candidates = table.relay_candidates(2, &[]);
        assert_eq!(candidates[0].peer_id, strong);
    }

    #[test]
    fn test_exclusions_by_peer_and_ip() {
        let table = table();
        let a = add_complete_peer(&table, 1, 10, 50);

        // Same IP as peer 1, different key
        let dup_id = table.insert([9; 32], "10.0.1.1:7001".parse().unwrap());
        table.with_peer(&dup_id, |p| {
            p.handshake = HandshakeState::Complete;
            for _ in 0..10 {
                p.record_success(Some(Duration::from_millis(50)));
            }
        });

        // Substitutes for one slot may share a machine
        let candidates = table.relay_candidates(5, &[]);
        assert_eq!(candidates.len(), 2);

        // Once peer 1 is placed, its machine is off limits entirely
        let placed = table.get(&a).unwrap();
        let candidates = table.relay_candidates(5, &[placed]);
        assert!(candidates.is_empty(), "placed hop excludes its whole IP");
    }

    #[test]
    fn test_unreliable_and_slow_filtered() {
        let table = table();
        let bad = add_complete_peer(&table, 1, 0, 50);
        table.with_peer(&bad, |p| {
            for _ in 0..20 {
                p.record_failure();
            }
        });
        let slow = add_complete_peer(&table, 2, 10, 5000);
        let good = add_complete_peer(&table, 3, 10, 50);

        let candidates = table.relay_candidates(5, &[]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].peer_id, good);
        let _ = (bad, slow);
    }

    #[test]
    fn test_eviction_on_pressure() {
        let table = PeerTable::new(2, 0.5, Duration::from_millis(1500));
        let weak = add_complete_peer(&table, 1, 0, 50);
        table.with_peer(&weak, |p| {
            for _ in 0..10 {
                p.record_failure();
            }
        });
        add_complete_peer(&table, 2, 10, 50);
        add_complete_peer(&table, 3, 10, 50);

        assert_eq!(table.len(), 2);
        assert!(table.get(&weak).is_none(), "lowest score evicted first");
    }

    #[test]
    fn test_rejected_peer_never_selected() {
        let table = table();
        let id = add_complete_peer(&table, 1, 10, 50);
        table.reject(&id);
        assert!(table.relay_candidates(3, &[]).is_empty());
    }
}
