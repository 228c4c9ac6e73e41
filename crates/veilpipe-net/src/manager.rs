//! Circuit construction, traffic, and heartbeats
//!
//! The manager owns every locally-initiated circuit. Building walks the
//! hop list iteratively: CREATE to hop 0, then one EXTEND per further
//! hop, each exchange correlated by (circuit ID, request identifier)
//! and bounded by the response timeout. A relay that fails its exchange
//! is replaced by the next candidate until the per-hop retry budget
//! runs out.

use crate::circuit::{Circuit, CircuitError, CircuitState, CircuitStats, HopNode};
use crate::crypto::{derive_hop_secret, EphemeralExchange};
use crate::directory::PeerTable;
use crate::settings::TunnelSettings;
use crate::transport::UdpTransport;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use veilpipe_core::peer::Peer;
use veilpipe_core::wire::Message;

/// Destroy reason codes carried on the wire
pub mod destroy_reason {
    pub const FINISHED: u8 = 0;
    pub const BUILD_FAILED: u8 = 1;
    pub const HEARTBEAT_TIMEOUT: u8 = 2;
    pub const EXPIRED: u8 = 3;
    pub const SHUTDOWN: u8 = 4;
}

/// Lifecycle notifications for observers (pool, monitor, daemon)
#[derive(Clone, Debug)]
pub enum CircuitEvent {
    Established { id: u32, hops: u8 },
    Failed { id: u32, reason: String },
    Closed { id: u32 },
}

/// A CREATED/EXTENDED reply routed back to the waiting build step
struct PendingReply {
    ephemeral_key: [u8; 32],
    auth: Vec<u8>,
    candidates: Vec<SocketAddrV4>,
}

/// Owns locally-initiated circuits end to end
pub struct CircuitManager {
    transport: Arc<UdpTransport>,
    directory: Arc<PeerTable>,
    settings: TunnelSettings,
    circuits: RwLock<HashMap<u32, Arc<Mutex<Circuit>>>>,
    pending: Mutex<HashMap<(u32, u16), oneshot::Sender<PendingReply>>>,
    pending_pings: Mutex<HashMap<(u32, u16), Instant>>,
    discovered: Mutex<HashSet<SocketAddrV4>>,
    events: broadcast::Sender<CircuitEvent>,
    data_tx: mpsc::Sender<(u32, Vec<u8>)>,
}

impl CircuitManager {
    /// Build a manager; decrypted inbound payloads arrive on the
    /// returned channel as (circuit ID, plaintext).
    pub fn new(
        transport: Arc<UdpTransport>,
        directory: Arc<PeerTable>,
        settings: TunnelSettings,
    ) -> (Arc<Self>, mpsc::Receiver<(u32, Vec<u8>)>) {
        let (data_tx, data_rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(64);
        let manager = Arc::new(Self {
            transport,
            directory,
            settings,
            circuits: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            discovered: Mutex::new(HashSet::new()),
            events,
            data_tx,
        });
        (manager, data_rx)
    }

    /// Subscribe to circuit lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    /// Peer addresses learned from CREATED/EXTENDED candidate lists,
    /// drained for the discovery layer to introduce itself to.
    pub fn drain_discovered(&self) -> Vec<SocketAddrV4> {
        self.discovered.lock().drain().collect()
    }

    /// Build a circuit of `hop_count` hops. Returns the circuit ID once
    /// every hop key is confirmed, or tears down the partial chain.
    pub async fn create_circuit(self: &Arc<Self>, hop_count: u8) -> Result<u32, CircuitError> {
        if hop_count < self.settings.min_hops || hop_count > self.settings.max_hops {
            return Err(CircuitError::InvalidHopCount(hop_count));
        }

        // Over-fetch so every hop has substitutes
        let wanted = hop_count as usize + self.settings.hop_retry_limit as usize;
        let candidates = self.directory.relay_candidates(wanted, &[]);
        if candidates.len() < hop_count as usize {
            return Err(CircuitError::InsufficientRelays {
                needed: hop_count as usize,
                available: candidates.len(),
            });
        }

        // Allocation and insertion under one lock so concurrent builds
        // cannot pick the same ID
        let (circuit_id, circuit) = {
            let mut circuits = self.circuits.write();
            let circuit_id = Self::unused_circuit_id(&circuits);
            let circuit = Arc::new(Mutex::new(Circuit::new(
                circuit_id,
                hop_count,
                self.settings.circuit_lifetime,
            )));
            circuits.insert(circuit_id, Arc::clone(&circuit));
            (circuit_id, circuit)
        };

        // Tears the partial chain down if the build future is dropped
        let mut guard = BuildGuard {
            manager: Arc::clone(self),
            circuit_id,
            armed: true,
        };

        let mut pool = candidates.into_iter();
        let mut used_ips: HashSet<Ipv4Addr> = HashSet::new();
        let mut built: u8 = 0;
        for hop_index in 0..hop_count {
            let mut attempts = 0u32;
            let mut done = false;
            while !done {
                let Some(relay) = pool.next() else { break };
                // Substitutes may share a machine, placed hops may not
                if used_ips.contains(relay.addr.ip()) {
                    continue;
                }
                attempts += 1;
                match self.build_hop(&circuit, hop_index, &relay).await {
                    Ok(()) => {
                        used_ips.insert(*relay.addr.ip());
                        built += 1;
                        done = true;
                    }
                    Err(e) => {
                        debug!(
                            circuit = circuit_id,
                            hop = hop_index,
                            relay = %relay.peer_id,
                            "hop exchange failed: {e}"
                        );
                        self.directory.report_outcome(&relay.peer_id, false, None);
                        if attempts > self.settings.hop_retry_limit {
                            break;
                        }
                    }
                }
            }
            if !done {
                break;
            }
        }

        guard.armed = false;
        if built < hop_count {
            self.fail_and_teardown(circuit_id, "ran out of relay candidates")
                .await;
            return Err(CircuitError::EstablishmentFailed {
                requested: hop_count,
                established: built,
            });
        }

        circuit.lock().mark_established()?;
        info!(circuit = circuit_id, hops = hop_count, "circuit established");
        let _ = self.events.send(CircuitEvent::Established {
            id: circuit_id,
            hops: hop_count,
        });
        Ok(circuit_id)
    }

    /// One CREATE or EXTEND exchange with key confirmation
    async fn build_hop(
        &self,
        circuit: &Arc<Mutex<Circuit>>,
        hop_index: u8,
        relay: &Peer,
    ) -> Result<(), CircuitError> {
        let circuit_id = circuit.lock().id();
        let identifier: u16 = rand::thread_rng().gen();
        let exchange = EphemeralExchange::new();
        let our_eph = exchange.public_key();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert((circuit_id, identifier), tx);

        let (msg, send_to) = if hop_index == 0 {
            (
                Message::Create {
                    circuit_id,
                    identifier,
                    node_key: relay.public_key,
                    ephemeral_key: our_eph,
                },
                relay.addr,
            )
        } else {
            // Extensions travel through the first hop
            let first = circuit
                .lock()
                .first_hop_addr()
                .ok_or(CircuitError::NotFound(circuit_id))?;
            (
                Message::Extend {
                    circuit_id,
                    identifier,
                    node_key: relay.public_key,
                    addr: relay.addr,
                    ephemeral_key: our_eph,
                },
                first,
            )
        };

        let started = Instant::now();
        let send_result = self
            .transport
            .send_with_retry(
                &msg.encode(),
                send_to,
                self.settings.send_retry_limit,
                self.settings.send_retry_base,
            )
            .await;
        if let Err(e) = send_result {
            self.pending.lock().remove(&(circuit_id, identifier));
            return Err(e.into());
        }

        let reply = match tokio::time::timeout(self.settings.response_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            _ => {
                self.pending.lock().remove(&(circuit_id, identifier));
                return Err(CircuitError::EstablishmentFailed {
                    requested: hop_index + 1,
                    established: hop_index,
                });
            }
        };
        let rtt = started.elapsed();

        let shared = exchange.complete(&reply.ephemeral_key);
        let (key, auth) = derive_hop_secret(&shared, &our_eph, &reply.ephemeral_key)?;
        if reply.auth != auth {
            return Err(CircuitError::KeyConfirmation);
        }

        circuit
            .lock()
            .add_hop(HopNode::new(relay.peer_id, relay.public_key, relay.addr, key))?;
        self.directory.report_outcome(&relay.peer_id, true, Some(rtt));
        if !reply.candidates.is_empty() {
            self.discovered.lock().extend(reply.candidates);
        }
        Ok(())
    }

    /// Route one inbound circuit message
    pub async fn handle_message(&self, msg: Message, from: SocketAddrV4) {
        match msg {
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
                let waiter = self.pending.lock().remove(&(circuit_id, identifier));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(PendingReply {
                            ephemeral_key,
                            auth,
                            candidates,
                        });
                    }
                    None => {
                        debug!(
                            circuit = circuit_id,
                            identifier, "reply without a pending exchange, dropping"
                        );
                    }
                }
            }
            Message::Pong {
                circuit_id,
                identifier,
            } => {
                let sent = self.pending_pings.lock().remove(&(circuit_id, identifier));
                if let Some(circuit) = self.circuit(circuit_id) {
                    let mut circuit = circuit.lock();
                    circuit.touch();
                    if let Some(sent) = sent {
                        circuit.set_rtt(sent.elapsed());
                    }
                }
            }
            Message::Destroy { circuit_id, reason } => {
                info!(circuit = circuit_id, reason, "remote destroyed circuit");
                if let Some(circuit) = self.circuits.write().remove(&circuit_id) {
                    circuit.lock().close();
                    let _ = self.events.send(CircuitEvent::Closed { id: circuit_id });
                }
            }
            Message::Data {
                circuit_id,
                payload,
            } => {
                let plaintext = match self.circuit(circuit_id) {
                    Some(circuit) => circuit.lock().decrypt_layers(&payload),
                    None => {
                        debug!(circuit = circuit_id, "data for unknown circuit");
                        return;
                    }
                };
                match plaintext {
                    Ok(plaintext) => {
                        if self.data_tx.send((circuit_id, plaintext)).await.is_err() {
                            warn!("data receiver dropped, discarding payload");
                        }
                    }
                    Err(e) => {
                        debug!(circuit = circuit_id, "undecryptable data from {from}: {e}");
                    }
                }
            }
            other => {
                debug!("circuit manager ignoring {:?} from {from}", other.kind());
            }
        }
    }

    /// Onion-wrap and send application bytes down an established circuit
    pub async fn send_data(&self, circuit_id: u32, payload: &[u8]) -> Result<(), CircuitError> {
        let (wrapped, first_hop) = {
            let circuit = self
                .circuit(circuit_id)
                .ok_or(CircuitError::NotFound(circuit_id))?;
            let mut circuit = circuit.lock();
            let wrapped = circuit.encrypt_layers(payload)?;
            let first_hop = circuit
                .first_hop_addr()
                .ok_or(CircuitError::NotFound(circuit_id))?;
            (wrapped, first_hop)
        };

        let msg = Message::Data {
            circuit_id,
            payload: wrapped,
        };
        self.transport
            .send_with_retry(
                &msg.encode(),
                first_hop,
                self.settings.send_retry_limit,
                self.settings.send_retry_base,
            )
            .await?;
        Ok(())
    }

    /// Send a PING to every established circuit and fail the silent
    /// ones. Called from the heartbeat loop and from tests directly.
    pub async fn heartbeat_tick(&self) {
        let snapshot: Vec<(u32, Arc<Mutex<Circuit>>)> = self
            .circuits
            .read()
            .iter()
            .map(|(id, c)| (*id, Arc::clone(c)))
            .collect();

        for (id, circuit) in snapshot {
            let (state, idle, first_hop) = {
                let c = circuit.lock();
                (c.state(), c.idle_for(), c.first_hop_addr())
            };
            if state != CircuitState::Established {
                continue;
            }

            if idle > self.settings.heartbeat_timeout {
                warn!(circuit = id, idle = ?idle, "heartbeat timeout");
                circuit.lock().mark_failed("heartbeat timeout");
                let _ = self.events.send(CircuitEvent::Failed {
                    id,
                    reason: "heartbeat timeout".into(),
                });
                continue;
            }

            let Some(first_hop) = first_hop else { continue };
            let identifier: u16 = rand::thread_rng().gen();
            self.pending_pings
                .lock()
                .insert((id, identifier), Instant::now());
            let ping = Message::Ping {
                circuit_id: id,
                identifier,
            };
            if let Err(e) = self.transport.send(&ping.encode(), first_hop).await {
                debug!(circuit = id, "ping send failed: {e}");
            }
        }
    }

    /// Background heartbeat loop
    pub fn spawn_heartbeat(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let interval = self.settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.heartbeat_tick().await,
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    /// Tear down a circuit: notify the first hop, zero the keys, drop
    /// the entry.
    pub async fn destroy_circuit(&self, circuit_id: u32, reason: u8) {
        let circuit = self.circuits.write().remove(&circuit_id);
        let Some(circuit) = circuit else { return };

        let first_hop = {
            let mut c = circuit.lock();
            let first_hop = c.first_hop_addr();
            c.close();
            first_hop
        };

        if let Some(first_hop) = first_hop {
            let msg = Message::Destroy { circuit_id, reason };
            if let Err(e) = self.transport.send(&msg.encode(), first_hop).await {
                debug!(circuit = circuit_id, "destroy notify failed: {e}");
            }
        }
        let _ = self.events.send(CircuitEvent::Closed { id: circuit_id });
    }

    /// Mark failed, notify the first hop, emit the event. The entry
    /// stays for the monitor to reap so callers can read the error.
    async fn fail_and_teardown(&self, circuit_id: u32, reason: &str) {
        let Some(circuit) = self.circuit(circuit_id) else {
            return;
        };
        let first_hop = {
            let mut c = circuit.lock();
            c.mark_failed(reason);
            c.first_hop_addr()
        };
        if let Some(first_hop) = first_hop {
            let msg = Message::Destroy {
                circuit_id,
                reason: destroy_reason::BUILD_FAILED,
            };
            let _ = self.transport.send(&msg.encode(), first_hop).await;
        }
        let _ = self.events.send(CircuitEvent::Failed {
            id: circuit_id,
            reason: reason.into(),
        });
    }

    /// Remove one circuit without wire notification (monitor reap path)
    pub fn remove_circuit(&self, circuit_id: u32) {
        if let Some(circuit) = self.circuits.write().remove(&circuit_id) {
            circuit.lock().close();
            let _ = self.events.send(CircuitEvent::Closed { id: circuit_id });
        }
    }

    /// Stats for one circuit
    pub fn circuit_stats(&self, circuit_id: u32) -> Option<CircuitStats> {
        self.circuit(circuit_id).map(|c| c.lock().stats())
    }

    /// Stats for every live circuit
    pub fn list_circuits(&self) -> Vec<CircuitStats> {
        self.circuits
            .read()
            .values()
            .map(|c| c.lock().stats())
            .collect()
    }

    /// Whether a circuit is established and unexpired
    pub fn is_healthy(&self, circuit_id: u32) -> bool {
        self.circuit(circuit_id)
            .map(|c| c.lock().is_healthy())
            .unwrap_or(false)
    }

    pub fn circuit_count(&self) -> usize {
        self.circuits.read().len()
    }

    /// Whether this node originated the circuit (live entry or an
    /// exchange still in flight). Used to route inbound datagrams
    /// between the origin and relay roles.
    pub fn owns(&self, circuit_id: u32) -> bool {
        if self.circuits.read().contains_key(&circuit_id) {
            return true;
        }
        self.pending
            .lock()
            .keys()
            .any(|(id, _)| *id == circuit_id)
    }

    fn circuit(&self, circuit_id: u32) -> Option<Arc<Mutex<Circuit>>> {
        self.circuits.read().get(&circuit_id).cloned()
    }

    /// Random nonzero circuit ID unused in the given map. Callers hold
    /// the write lock across allocation and insertion.
    fn unused_circuit_id(circuits: &HashMap<u32, Arc<Mutex<Circuit>>>) -> u32 {
        loop {
            let id: u32 = rand::thread_rng().gen();
            if id != 0 && !circuits.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Tears down a partially built circuit if the owning future is
/// dropped mid-build (caller timeout or task cancellation).
struct BuildGuard {
    manager: Arc<CircuitManager>,
    circuit_id: u32,
    armed: bool,
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let manager = Arc::clone(&self.manager);
        let circuit_id = self.circuit_id;
        tokio::spawn(async move {
            manager
                .fail_and_teardown(circuit_id, "build cancelled")
                .await;
        });
    }
}
