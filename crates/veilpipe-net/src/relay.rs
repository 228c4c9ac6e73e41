//! Relay-side circuit handling
//!
//! A relay knows exactly one layer of each circuit that crosses it: the
//! previous hop's address, its own hop key, and optionally the next
//! hop. Incoming and outgoing legs use different circuit IDs; the relay
//! translates between them in both directions and never sees more than
//! one onion layer.

use crate::crypto::{derive_hop_secret, EphemeralExchange, HopKey};
use crate::directory::PeerTable;
use crate::onion;
use crate::settings::TunnelSettings;
use crate::transport::UdpTransport;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use veilpipe_core::wire::Message;

/// Active relay legs before the oldest is evicted
const MAX_SESSIONS: usize = 1024;

/// Candidate addresses included in CREATED/EXTENDED replies
const REPLY_CANDIDATES: usize = 4;

/// Relay errors; only surfaced to the local caller, never the wire
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no relay session for circuit {0}")]
    UnknownSession(u32),
    #[error("onion error: {0}")]
    Onion(#[from] onion::OnionError),
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}

/// The downstream leg of a relayed circuit
#[derive(Clone, Copy, Debug)]
struct NextHop {
    addr: SocketAddrV4,
    circuit_id: u32,
}

/// One circuit crossing this relay
struct RelaySession {
    key: HopKey,
    prev: SocketAddrV4,
    next: Option<NextHop>,
    created_at: Instant,
}

/// Traffic counters
#[derive(Clone, Copy, Debug, Default)]
pub struct RelayStats {
    pub active_sessions: usize,
    pub cells_forwarded: u64,
    pub cells_returned: u64,
}

/// Relay endpoint: answers CREATE/EXTEND, shuttles DATA/PING both ways
pub struct RelayNode {
    transport: Arc<UdpTransport>,
    directory: Arc<PeerTable>,
    settings: TunnelSettings,
    /// Keyed by the incoming (previous-hop) circuit ID
    sessions: RwLock<HashMap<u32, RelaySession>>,
    /// Outgoing circuit ID back to the incoming one
    back_refs: RwLock<HashMap<u32, u32>>,
    forwarded: RwLock<u64>,
    returned: RwLock<u64>,
    exit_tx: mpsc::Sender<(u32, Vec<u8>)>,
}

impl RelayNode {
    /// Fully-peeled payloads that terminate here arrive on the returned
    /// channel as (incoming circuit ID, plaintext).
    pub fn new(
        transport: Arc<UdpTransport>,
        directory: Arc<PeerTable>,
        settings: TunnelSettings,
    ) -> (Arc<Self>, mpsc::Receiver<(u32, Vec<u8>)>) {
        let (exit_tx, exit_rx) = mpsc::channel(256);
        let node = Arc::new(Self {
            transport,
            directory,
            settings,
            sessions: RwLock::new(HashMap::new()),
            back_refs: RwLock::new(HashMap::new()),
            forwarded: RwLock::new(0),
            returned: RwLock::new(0),
            exit_tx,
        });
        (node, exit_rx)
    }

    /// Route one inbound circuit message. Unknown or malformed traffic
    /// is dropped without a wire response.
    pub async fn handle(&self, msg: Message, from: SocketAddrV4) {
        match msg {
            Message::Create {
                circuit_id,
                identifier,
                ephemeral_key,
                ..
            } => self.on_create(circuit_id, identifier, ephemeral_key, from).await,
            Message::Extend {
                circuit_id,
                identifier,
                node_key,
                addr,
                ephemeral_key,
            } => {
                self.on_extend(circuit_id, identifier, node_key, addr, ephemeral_key, from)
                    .await
            }
            Message::Created {
                circuit_id,
                identifier,
                ephemeral_key,
                auth,
                candidates,
            }
            | Message::Extended {
                circuit_id,
                identifier,
                ephemeral_key,
                auth,
                candidates,
            } => {
                self.on_extend_reply(circuit_id, identifier, ephemeral_key, auth, candidates)
                    .await
            }
            Message::Data {
                circuit_id,
                payload,
            } => self.on_data(circuit_id, payload, from).await,
            Message::Ping {
                circuit_id,
                identifier,
            } => self.on_ping(circuit_id, identifier, from).await,
            Message::Pong {
                circuit_id,
                identifier,
            } => self.on_pong(circuit_id, identifier).await,
            Message::Destroy { circuit_id, reason } => {
                self.on_destroy(circuit_id, reason, from).await
            }
            other => {
                debug!("relay ignoring {:?} from {from}", other.kind());
            }
        }
    }

    /// Answer a CREATE: derive the hop key, open a session for the
    /// previous hop.
    async fn on_create(
        &self,
        circuit_id: u32,
        identifier: u16,
        their_eph: [u8; 32],
        from: SocketAddrV4,
    ) {
        let exchange = EphemeralExchange::new();
        let our_eph = exchange.public_key();
        let shared = exchange.complete(&their_eph);
        let (key, auth) = match derive_hop_secret(&shared, &their_eph, &our_eph) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(circuit = circuit_id, "key derivation failed: {e}");
                return;
            }
        };

        {
            let mut sessions = self.sessions.write();
            if sessions.len() >= MAX_SESSIONS {
                let oldest = sessions
                    .iter()
                    .min_by_key(|(_, s)| s.created_at)
                    .map(|(id, _)| *id);
                if let Some(id) = oldest {
                    debug!(circuit = id, "session table full, evicting oldest");
                    if let Some(old) = sessions.remove(&id) {
                        if let Some(next) = old.next {
                            self.back_refs.write().remove(&next.circuit_id);
                        }
                    }
                }
            }
            sessions.insert(
                circuit_id,
                RelaySession {
                    key,
                    prev: from,
                    next: None,
                    created_at: Instant::now(),
                },
            );
        }

        let reply = Message::Created {
            circuit_id,
            identifier,
            ephemeral_key: our_eph,
            auth: auth.to_vec(),
            candidates: self.directory.known_addresses(REPLY_CANDIDATES),
        };
        if let Err(e) = self.transport.send(&reply.encode(), from).await {
            debug!(circuit = circuit_id, "created reply failed: {e}");
        }
        info!(circuit = circuit_id, prev = %from, "relay session opened");
    }

    /// Handle an EXTEND: a terminal relay opens a fresh outgoing leg
    /// with a CREATE; a mid-chain relay passes the EXTEND down its
    /// existing leg so the real terminal performs the extension.
    async fn on_extend(
        &self,
        circuit_id: u32,
        identifier: u16,
        node_key: [u8; 32],
        target: SocketAddrV4,
        ephemeral_key: [u8; 32],
        from: SocketAddrV4,
    ) {
        enum Leg {
            Open(u32),
            Forward(NextHop),
        }

        let leg = {
            let sessions = self.sessions.read();
            let Some(session) = sessions.get(&circuit_id) else {
                debug!(circuit = circuit_id, "extend for unknown session");
                return;
            };
            if session.prev != from {
                debug!(circuit = circuit_id, "extend from non-adjacent sender {from}");
                return;
            }
            match session.next {
                Some(next) => Leg::Forward(next),
                None => Leg::Open(self.allocate_leg_id(&sessions)),
            }
        };

        match leg {
            Leg::Forward(next) => {
                let extend = Message::Extend {
                    circuit_id: next.circuit_id,
                    identifier,
                    node_key,
                    addr: target,
                    ephemeral_key,
                };
                if let Err(e) = self.transport.send(&extend.encode(), next.addr).await {
                    debug!(circuit = circuit_id, "extend relay to {} failed: {e}", next.addr);
                }
            }
            Leg::Open(out_id) => {
                {
                    let mut sessions = self.sessions.write();
                    let Some(session) = sessions.get_mut(&circuit_id) else {
                        return;
                    };
                    session.next = Some(NextHop {
                        addr: target,
                        circuit_id: out_id,
                    });
                }
                self.back_refs.write().insert(out_id, circuit_id);

                let create = Message::Create {
                    circuit_id: out_id,
                    identifier,
                    node_key,
                    ephemeral_key,
                };
                if let Err(e) = self.transport.send(&create.encode(), target).await {
                    debug!(circuit = circuit_id, "extend forward to {target} failed: {e}");
                }
            }
        }
    }

    /// Translate a CREATED or EXTENDED arriving on an outgoing leg into
    /// an EXTENDED for the previous hop.
    async fn on_extend_reply(
        &self,
        out_id: u32,
        identifier: u16,
        ephemeral_key: [u8; 32],
        auth: Vec<u8>,
        candidates: Vec<SocketAddrV4>,
    ) {
        // Lock order is sessions before back_refs everywhere; the map
        // lookup is bound first so its guard is released here.
        let mapped = self.back_refs.read().get(&out_id).copied();
        let Some(in_id) = mapped else {
            debug!(circuit = out_id, "reply for unknown outgoing leg");
            return;
        };
        let prev = match self.sessions.read().get(&in_id) {
            Some(s) => s.prev,
            None => return,
        };

        let extended = Message::Extended {
            circuit_id: in_id,
            identifier,
            ephemeral_key,
            auth,
            candidates,
        };
        if let Err(e) = self.transport.send(&extended.encode(), prev).await {
            debug!(circuit = in_id, "extended reply failed: {e}");
        }
    }

    /// DATA from the previous hop is peeled and forwarded (or delivered
    /// here when terminal); DATA from the next hop is wrapped and sent
    /// back.
    async fn on_data(&self, circuit_id: u32, payload: Vec<u8>, from: SocketAddrV4) {
        // Downstream leg first: traffic flowing back toward the origin
        let mapped = self.back_refs.read().get(&circuit_id).copied();
        if let Some(in_id) = mapped {
            let (wrapped, prev) = {
                let sessions = self.sessions.read();
                let Some(session) = sessions.get(&in_id) else {
                    return;
                };
                match onion::encrypt_for_hop(&session.key, &payload) {
                    Ok(wrapped) => (wrapped, session.prev),
                    Err(e) => {
                        debug!(circuit = in_id, "return wrap failed: {e}");
                        return;
                    }
                }
            };
            let msg = Message::Data {
                circuit_id: in_id,
                payload: wrapped,
            };
            if self.transport.send(&msg.encode(), prev).await.is_ok() {
                *self.returned.write() += 1;
            }
            return;
        }

        let (inner, next) = {
            let sessions = self.sessions.read();
            let Some(session) = sessions.get(&circuit_id) else {
                debug!(circuit = circuit_id, "data for unknown session");
                return;
            };
            if session.prev != from {
                debug!(circuit = circuit_id, "data from non-adjacent sender {from}");
                return;
            }
            match onion::decrypt_from_hop(&session.key, &payload) {
                Ok(inner) => (inner, session.next),
                Err(e) => {
                    debug!(circuit = circuit_id, "layer decrypt failed, dropping: {e}");
                    return;
                }
            }
        };

        match next {
            Some(next) => {
                let msg = Message::Data {
                    circuit_id: next.circuit_id,
                    payload: inner,
                };
                if self.transport.send(&msg.encode(), next.addr).await.is_ok() {
                    *self.forwarded.write() += 1;
                }
            }
            None => {
                // Terminal hop: fully peeled payload belongs to us
                if self.exit_tx.send((circuit_id, inner)).await.is_err() {
                    warn!("exit receiver dropped, discarding payload");
                }
            }
        }
    }

    /// Send a reply back toward the circuit origin, adding our layer.
    /// Only meaningful on the terminal hop.
    pub async fn send_back(&self, circuit_id: u32, payload: &[u8]) -> Result<(), RelayError> {
        let (wrapped, prev) = {
            let sessions = self.sessions.read();
            let session = sessions
                .get(&circuit_id)
                .ok_or(RelayError::UnknownSession(circuit_id))?;
            (onion::encrypt_for_hop(&session.key, payload)?, session.prev)
        };
        let msg = Message::Data {
            circuit_id,
            payload: wrapped,
        };
        self.transport.send(&msg.encode(), prev).await?;
        *self.returned.write() += 1;
        Ok(())
    }

    /// Forward PING downstream, or answer with PONG when terminal
    async fn on_ping(&self, circuit_id: u32, identifier: u16, from: SocketAddrV4) {
        let (prev, next) = {
            let sessions = self.sessions.read();
            let Some(session) = sessions.get(&circuit_id) else {
                return;
            };
            (session.prev, session.next)
        };
        if prev != from {
            return;
        }

        let (msg, to) = match next {
            Some(next) => (
                Message::Ping {
                    circuit_id: next.circuit_id,
                    identifier,
                },
                next.addr,
            ),
            None => (
                Message::Pong {
                    circuit_id,
                    identifier,
                },
                prev,
            ),
        };
        if let Err(e) = self.transport.send(&msg.encode(), to).await {
            debug!(circuit = circuit_id, "ping handling failed: {e}");
        }
    }

    /// Translate a downstream PONG back to the previous hop
    async fn on_pong(&self, out_id: u32, identifier: u16) {
        let mapped = self.back_refs.read().get(&out_id).copied();
        let Some(in_id) = mapped else {
            return;
        };
        let prev = match self.sessions.read().get(&in_id) {
            Some(s) => s.prev,
            None => return,
        };
        let pong = Message::Pong {
            circuit_id: in_id,
            identifier,
        };
        let _ = self.transport.send(&pong.encode(), prev).await;
    }

    /// Propagate DESTROY along the chain and drop our leg
    async fn on_destroy(&self, circuit_id: u32, reason: u8, from: SocketAddrV4) {
        // From downstream: map back and notify the previous hop
        let mapped = self.back_refs.write().remove(&circuit_id);
        if let Some(in_id) = mapped {
            let prev = self.sessions.write().remove(&in_id).map(|s| s.prev);
            if let Some(prev) = prev {
                let msg = Message::Destroy {
                    circuit_id: in_id,
                    reason,
                };
                let _ = self.transport.send(&msg.encode(), prev).await;
            }
            return;
        }

        let removed = {
            let mut sessions = self.sessions.write();
            match sessions.get(&circuit_id) {
                Some(s) if s.prev == from => sessions.remove(&circuit_id),
                _ => None,
            }
        };
        let Some(session) = removed else { return };
        info!(circuit = circuit_id, reason, "relay session destroyed");

        if let Some(next) = session.next {
            self.back_refs.write().remove(&next.circuit_id);
            let msg = Message::Destroy {
                circuit_id: next.circuit_id,
                reason,
            };
            let _ = self.transport.send(&msg.encode(), next.addr).await;
        }
    }

    /// Drop sessions older than the circuit lifetime, notifying both
    /// neighbors.
    pub async fn prune_expired(&self) {
        let cutoff = self.settings.circuit_lifetime;
        let expired: Vec<u32> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.created_at.elapsed() > cutoff)
            .map(|(id, _)| *id)
            .collect();

        for in_id in expired {
            let removed = self.sessions.write().remove(&in_id);
            let Some(session) = removed else { continue };
            info!(circuit = in_id, "relay session expired");

            let notify = Message::Destroy {
                circuit_id: in_id,
                reason: crate::manager::destroy_reason::EXPIRED,
            };
            let _ = self.transport.send(&notify.encode(), session.prev).await;

            if let Some(next) = session.next {
                self.back_refs.write().remove(&next.circuit_id);
                let notify = Message::Destroy {
                    circuit_id: next.circuit_id,
                    reason: crate::manager::destroy_reason::EXPIRED,
                };
                let _ = self.transport.send(&notify.encode(), next.addr).await;
            }
        }
    }

    /// Background expiry loop
    pub fn spawn_prune(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let interval = self.settings.monitor_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.prune_expired().await,
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            active_sessions: self.sessions.read().len(),
            cells_forwarded: *self.forwarded.read(),
            cells_returned: *self.returned.read(),
        }
    }

    /// Random nonzero leg ID unused on either side of the table
    fn allocate_leg_id(&self, sessions: &HashMap<u32, RelaySession>) -> u32 {
        let back_refs = self.back_refs.read();
        loop {
            let id: u32 = rand::thread_rng().gen();
            if id != 0 && !sessions.contains_key(&id) && !back_refs.contains_key(&id) {
                return id;
            }
        }
    }
}
