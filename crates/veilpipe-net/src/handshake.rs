//! Four-message introduction / NAT-puncture handshake
//!
//! Per-peer state machine producing "reachable, signature-verified"
//! peers. Every inbound signature is checked before any transition;
//! invalid signatures are dropped silently and only bump the sender's
//! failure counter. Version mismatch is terminal: the peer is rejected
//! permanently, never retried.

use crate::directory::PeerTable;
use crate::settings::TunnelSettings;
use crate::transport::{TransportError, UdpTransport};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use veilpipe_core::identity::NetworkIdentity;
use veilpipe_core::peer::{HandshakeState, PeerId};
use veilpipe_core::wire::{Message, PROTOCOL_VERSION};

/// Minimum puncture attempts before the NAT heuristic speaks
const MIN_PUNCTURE_SAMPLE: u32 = 4;

/// Handshake errors surfaced to callers. Inbound protocol violations
/// are never errors; they are dropped.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("handshake with {peer} is {state:?}, not retryable")]
    NotRetryable { peer: PeerId, state: HandshakeState },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Ephemeral per-peer handshake state
#[derive(Clone, Debug)]
pub struct HandshakeSession {
    pub peer: PeerId,
    pub state: HandshakeState,
    pub identifier: u32,
    pub started: Instant,
    pub deadline: Instant,
    pub attempts: u32,
}

impl HandshakeSession {
    /// Forward-only transition; the single backward edge is handled by
    /// the engine's retry path.
    fn advance(&mut self, next: HandshakeState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            debug!(
                "dropping illegal handshake transition {:?} -> {:?} for {}",
                self.state, next, self.peer
            );
            false
        }
    }
}

/// Hole-punch outcome counters across all peers
#[derive(Clone, Copy, Debug, Default)]
pub struct PunctureStats {
    pub attempted: u32,
    pub succeeded: u32,
}

/// Drives handshakes for every discovered peer
pub struct HandshakeEngine {
    identity: Arc<NetworkIdentity>,
    transport: Arc<UdpTransport>,
    directory: Arc<PeerTable>,
    settings: TunnelSettings,
    sessions: RwLock<HashMap<PeerId, HandshakeSession>>,
    by_identifier: RwLock<HashMap<u32, PeerId>>,
    /// Introductions sent to bare addresses whose key we do not know yet
    bootstrap_pending: RwLock<HashMap<u32, SocketAddrV4>>,
    puncture: RwLock<PunctureStats>,
}

impl HandshakeEngine {
    pub fn new(
        identity: Arc<NetworkIdentity>,
        transport: Arc<UdpTransport>,
        directory: Arc<PeerTable>,
        settings: TunnelSettings,
    ) -> Self {
        Self {
            identity,
            transport,
            directory,
            settings,
            sessions: RwLock::new(HashMap::new()),
            by_identifier: RwLock::new(HashMap::new()),
            bootstrap_pending: RwLock::new(HashMap::new()),
            puncture: RwLock::new(PunctureStats::default()),
        }
    }

    /// Introduce ourselves to a bare address (no key known yet). The
    /// peer enters the directory when its signed response arrives.
    pub async fn bootstrap(&self, addr: SocketAddrV4) -> Result<(), HandshakeError> {
        let identifier: u32 = rand::thread_rng().gen();
        self.bootstrap_pending.write().insert(identifier, addr);

        let request = Message::IntroductionRequest {
            identifier,
            public_key: self.identity.public_key(),
            source: self.transport.local_addr(),
            version: PROTOCOL_VERSION,
            signature: [0u8; 64],
        }
        .sign(&self.identity);

        self.transport
            .send_with_retry(
                &request.encode(),
                addr,
                self.settings.send_retry_limit,
                self.settings.send_retry_base,
            )
            .await?;
        debug!("bootstrap introduction to {addr}");
        Ok(())
    }

    /// Begin (or explicitly retry) a handshake with a known peer
    pub async fn start(&self, peer_id: PeerId) -> Result<(), HandshakeError> {
        let peer = self
            .directory
            .get(&peer_id)
            .ok_or(HandshakeError::UnknownPeer(peer_id))?;

        let (identifier, attempts) = {
            let mut sessions = self.sessions.write();
            if let Some(session) = sessions.get(&peer_id) {
                match session.state {
                    // Failed -> None is the only legal backward edge
                    HandshakeState::Failed => {}
                    HandshakeState::Complete | HandshakeState::None => {}
                    state => {
                        return Err(HandshakeError::NotRetryable {
                            peer: peer_id,
                            state,
                        })
                    }
                }
            }
            let attempts = sessions.get(&peer_id).map(|s| s.attempts).unwrap_or(0) + 1;
            let identifier: u32 = rand::thread_rng().gen();
            let now = Instant::now();
            sessions.insert(
                peer_id,
                HandshakeSession {
                    peer: peer_id,
                    state: HandshakeState::None,
                    identifier,
                    started: now,
                    deadline: now + self.settings.handshake_timeout,
                    attempts,
                },
            );
            self.by_identifier.write().insert(identifier, peer_id);
            (identifier, attempts)
        };

        let request = Message::IntroductionRequest {
            identifier,
            public_key: self.identity.public_key(),
            source: self.transport.local_addr(),
            version: PROTOCOL_VERSION,
            signature: [0u8; 64],
        }
        .sign(&self.identity);

        self.transport
            .send_with_retry(
                &request.encode(),
                peer.addr,
                self.settings.send_retry_limit,
                self.settings.send_retry_base,
            )
            .await?;

        self.transition(&peer_id, HandshakeState::IntroRequestSent);
        debug!(
            "introduction request to {} (attempt {})",
            peer_id, attempts
        );
        Ok(())
    }

    /// Route one inbound handshake message. Signature failures and
    /// protocol violations are swallowed here by design.
    pub async fn handle(&self, msg: Message, from: SocketAddrV4) {
        if !msg.verify_signature() {
            debug!("dropping handshake message with bad signature from {from}");
            if let Some(key) = msg.sender_key() {
                self.directory
                    .report_outcome(&PeerId::from_public_key(&key), false, None);
            }
            return;
        }

        match msg {
            Message::IntroductionRequest {
                identifier,
                public_key,
                version,
                ..
            } => {
                self.on_introduction_request(identifier, public_key, version, from)
                    .await
            }
            Message::IntroductionResponse {
                identifier,
                public_key,
                version,
                puncture_needed,
                intermediary,
                ..
            } => {
                self.on_introduction_response(
                    identifier,
                    public_key,
                    version,
                    puncture_needed,
                    intermediary,
                    from,
                )
                .await
            }
            Message::PunctureRequest {
                identifier, target, ..
            } => self.on_puncture_request(identifier, target).await,
            Message::Puncture {
                identifier,
                public_key,
                ..
            } => self.on_puncture(identifier, public_key),
            other => {
                debug!("handshake engine ignoring {:?}", other.kind());
            }
        }
    }

    /// Responder side: register the requester and answer.
    async fn on_introduction_request(
        &self,
        identifier: u32,
        public_key: [u8; 32],
        version: u16,
        from: SocketAddrV4,
    ) {
        let peer_id = self.directory.insert(public_key, from);
        self.directory.with_peer(&peer_id, |p| p.version = version);

        let response = Message::IntroductionResponse {
            identifier,
            public_key: self.identity.public_key(),
            version: PROTOCOL_VERSION,
            puncture_needed: false,
            intermediary: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            signature: [0u8; 64],
        }
        .sign(&self.identity);

        if let Err(e) = self.transport.send(&response.encode(), from).await {
            warn!("failed to answer introduction request from {from}: {e}");
        }
    }

    async fn on_introduction_response(
        &self,
        identifier: u32,
        public_key: [u8; 32],
        version: u16,
        puncture_needed: bool,
        intermediary: SocketAddrV4,
        from: SocketAddrV4,
    ) {
        let known = self.by_identifier.read().get(&identifier).copied();
        let Some(peer_id) = known else {
            let pending = self.bootstrap_pending.write().remove(&identifier);
            if pending.is_some() {
                self.complete_bootstrap(public_key, version, from);
            } else {
                debug!("introduction response with unknown identifier {identifier}");
            }
            return;
        };
        // The response must come from the key we introduced ourselves to
        if PeerId::from_public_key(&public_key) != peer_id {
            debug!("introduction response key does not match peer {peer_id}");
            self.directory.report_outcome(&peer_id, false, None);
            return;
        }

        if version != PROTOCOL_VERSION {
            info!(
                "peer {} speaks protocol {} (ours {}), rejecting permanently",
                peer_id, version, PROTOCOL_VERSION
            );
            self.fail_session(&peer_id, true);
            return;
        }

        if !self.transition(&peer_id, HandshakeState::IntroResponseReceived) {
            return;
        }
        self.directory.with_peer(&peer_id, |p| p.version = version);

        if puncture_needed {
            self.puncture.write().attempted += 1;
            let peer_addr = match self.directory.get(&peer_id) {
                Some(p) => p.addr,
                None => return,
            };
            let request = Message::PunctureRequest {
                identifier,
                public_key: self.identity.public_key(),
                target: peer_addr,
                signature: [0u8; 64],
            }
            .sign(&self.identity);

            if let Err(e) = self.transport.send(&request.encode(), intermediary).await {
                warn!("puncture request to {intermediary} failed: {e}");
                return;
            }
            self.transition(&peer_id, HandshakeState::PunctureRequestSent);
        } else {
            self.complete_session(&peer_id);
        }
    }

    /// A signed response to a bootstrap introduction proves the peer
    /// is live and reachable; it enters the directory ready to use.
    fn complete_bootstrap(&self, public_key: [u8; 32], version: u16, from: SocketAddrV4) {
        let peer_id = self.directory.insert(public_key, from);
        if version != PROTOCOL_VERSION {
            info!(
                "bootstrap peer {} speaks protocol {} (ours {}), rejecting",
                peer_id, version, PROTOCOL_VERSION
            );
            self.directory.reject(&peer_id);
            return;
        }
        self.directory.with_peer(&peer_id, |p| {
            p.version = version;
            p.handshake = HandshakeState::Complete;
        });
        self.directory.report_outcome(&peer_id, true, None);
        info!("bootstrap peer {} joined from {}", peer_id, from);
    }

    /// Intermediary side: punch toward the target on the requester's
    /// behalf.
    async fn on_puncture_request(&self, identifier: u32, target: SocketAddrV4) {
        let puncture = Message::Puncture {
            identifier,
            public_key: self.identity.public_key(),
            signature: [0u8; 64],
        }
        .sign(&self.identity);

        if let Err(e) = self.transport.send(&puncture.encode(), target).await {
            warn!("puncture to {target} failed: {e}");
        }
    }

    fn on_puncture(&self, identifier: u32, _public_key: [u8; 32]) {
        let Some(peer_id) = self.by_identifier.read().get(&identifier).copied() else {
            debug!("puncture with unknown identifier {identifier}");
            return;
        };
        if !self.transition(&peer_id, HandshakeState::PunctureReceived) {
            return;
        }
        self.puncture.write().succeeded += 1;
        self.complete_session(&peer_id);
    }

    /// Fail every session past its deadline; peers become unreachable.
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<PeerId> = self
            .sessions
            .read()
            .values()
            .filter(|s| {
                now > s.deadline
                    && !matches!(s.state, HandshakeState::Complete | HandshakeState::Failed)
            })
            .map(|s| s.peer)
            .collect();

        for peer_id in expired {
            info!("handshake with {} timed out", peer_id);
            self.fail_session(&peer_id, false);
        }
    }

    /// Background sweep loop
    pub fn spawn_sweep(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep(),
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    /// Session snapshot for introspection
    pub fn session(&self, peer_id: &PeerId) -> Option<HandshakeSession> {
        self.sessions.read().get(peer_id).cloned()
    }

    /// Hole-punch counters
    pub fn puncture_stats(&self) -> PunctureStats {
        *self.puncture.read()
    }

    /// True once hole-punching has failed for the majority of a
    /// minimum sample; callers should prefer relay-only behavior.
    pub fn likely_symmetric_nat(&self) -> bool {
        let stats = self.puncture.read();
        stats.attempted >= MIN_PUNCTURE_SAMPLE && stats.succeeded * 2 < stats.attempted
    }

    fn transition(&self, peer_id: &PeerId, next: HandshakeState) -> bool {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(peer_id) else {
            return false;
        };
        if !session.advance(next) {
            return false;
        }
        drop(sessions);
        self.directory.with_peer(peer_id, |p| p.handshake = next);
        true
    }

    fn complete_session(&self, peer_id: &PeerId) {
        let rtt = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(peer_id) else {
                return;
            };
            if !session.advance(HandshakeState::Complete) {
                return;
            }
            let rtt = session.started.elapsed();
            self.by_identifier.write().remove(&session.identifier);
            rtt
        };
        self.directory.with_peer(peer_id, |p| {
            p.handshake = HandshakeState::Complete;
        });
        self.directory.report_outcome(peer_id, true, Some(rtt));
        info!("handshake with {} complete in {:?}", peer_id, rtt);
    }

    fn fail_session(&self, peer_id: &PeerId, permanent: bool) {
        {
            let mut sessions = self.sessions.write();
            if let Some(session) = sessions.get_mut(peer_id) {
                session.state = HandshakeState::Failed;
                self.by_identifier.write().remove(&session.identifier);
            }
        }
        if permanent {
            self.directory.reject(peer_id);
        } else {
            self.directory.mark_unreachable(peer_id);
        }
    }
}
