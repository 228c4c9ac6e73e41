//! veild node - wiring and main service loop

use crate::config::Config;
use std::net::SocketAddrV4;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use veilpipe_core::identity::NetworkIdentity;
use veilpipe_core::wire::{Message, MessageKind};
use veilpipe_net::directory::PeerTable;
use veilpipe_net::handshake::HandshakeEngine;
use veilpipe_net::manager::{destroy_reason, CircuitManager};
use veilpipe_net::monitor::HealthMonitor;
use veilpipe_net::pool::CircuitPool;
use veilpipe_net::relay::RelayNode;
use veilpipe_net::settings::SettingsError;
use veilpipe_net::transport::{Datagram, TransportError, UdpTransport};

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Handles for controlling and observing a running node
#[derive(Clone)]
pub struct NodeHandle {
    pub local_addr: SocketAddrV4,
    pub directory: Arc<PeerTable>,
    pub engine: Arc<HandshakeEngine>,
    pub manager: Arc<CircuitManager>,
    pub pool: Arc<CircuitPool>,
    /// Payloads returned over our own circuits
    pub data: broadcast::Sender<(u32, Vec<u8>)>,
    pub shutdown: broadcast::Sender<()>,
}

/// A fully wired node: transport, handshake engine, circuit engine,
/// optional relay role.
pub struct Node {
    config: Config,
    transport: Arc<UdpTransport>,
    inbound: mpsc::Receiver<Datagram>,
    directory: Arc<PeerTable>,
    engine: Arc<HandshakeEngine>,
    manager: Arc<CircuitManager>,
    data_rx: mpsc::Receiver<(u32, Vec<u8>)>,
    relay: Option<Arc<RelayNode>>,
    exit_rx: Option<mpsc::Receiver<(u32, Vec<u8>)>>,
    pool: Arc<CircuitPool>,
    monitor: Arc<HealthMonitor>,
    data_events: broadcast::Sender<(u32, Vec<u8>)>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Node {
    /// Bind the socket and wire every component
    pub async fn new(config: Config) -> Result<Self, NodeError> {
        let settings = config.tunnel_settings();
        settings.validate()?;
        let identity: Arc<NetworkIdentity> = Arc::new(
            config
                .identity()
                .map_err(|e| NodeError::Config(e.to_string()))?,
        );

        let (transport, inbound) = UdpTransport::bind(config.listen).await?;
        let directory = Arc::new(PeerTable::new(
            settings.max_peers,
            settings.min_relay_score,
            settings.max_relay_rtt,
        ));

        let engine = Arc::new(HandshakeEngine::new(
            Arc::clone(&identity),
            Arc::clone(&transport),
            Arc::clone(&directory),
            settings.clone(),
        ));
        let (manager, data_rx) = CircuitManager::new(
            Arc::clone(&transport),
            Arc::clone(&directory),
            settings.clone(),
        );

        let (relay, exit_rx) = if config.relay {
            let (relay, exit_rx) = RelayNode::new(
                Arc::clone(&transport),
                Arc::clone(&directory),
                settings.clone(),
            );
            (Some(relay), Some(exit_rx))
        } else {
            (None, None)
        };

        let pool = CircuitPool::new(Arc::clone(&manager), settings.clone());
        let monitor = HealthMonitor::new(Arc::clone(&manager), Arc::clone(&pool), settings);

        let (data_events, _) = broadcast::channel(64);
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            "node identity {} listening on {}",
            identity.peer_id(),
            transport.local_addr()
        );

        Ok(Self {
            config,
            transport,
            inbound,
            directory,
            engine,
            manager,
            data_rx,
            relay,
            exit_rx,
            pool,
            monitor,
            data_events,
            shutdown_tx,
        })
    }

    /// Control/observation handles, valid for the node's lifetime
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            local_addr: self.transport.local_addr(),
            directory: Arc::clone(&self.directory),
            engine: Arc::clone(&self.engine),
            manager: Arc::clone(&self.manager),
            pool: Arc::clone(&self.pool),
            data: self.data_events.clone(),
            shutdown: self.shutdown_tx.clone(),
        }
    }

    /// Main service loop: bootstrap, background tasks, dispatch
    pub async fn run(mut self) -> Result<(), NodeError> {
        for addr in &self.config.bootstrap {
            info!("bootstrap peer: {addr}");
            if let Err(e) = self.engine.bootstrap(*addr).await {
                warn!("bootstrap to {addr} failed: {e}");
            }
        }

        let sweep_task = Arc::clone(&self.engine).spawn_sweep(self.shutdown_tx.subscribe());
        let heartbeat_task =
            Arc::clone(&self.manager).spawn_heartbeat(self.shutdown_tx.subscribe());
        let monitor_task = Arc::clone(&self.monitor).spawn(self.shutdown_tx.subscribe());

        // Relay role: expire stale sessions, echo terminal payloads
        // back so circuit owners can verify the round trip.
        let mut relay_tasks = Vec::new();
        if let (Some(relay), Some(mut exit_rx)) = (self.relay.clone(), self.exit_rx.take()) {
            relay_tasks.push(Arc::clone(&relay).spawn_prune(self.shutdown_tx.subscribe()));
            relay_tasks.push(tokio::spawn(async move {
                while let Some((circuit_id, payload)) = exit_rx.recv().await {
                    if let Err(e) = relay.send_back(circuit_id, &payload).await {
                        debug!(circuit = circuit_id, "echo reply failed: {e}");
                    }
                }
            }));
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                datagram = self.inbound.recv() => {
                    match datagram {
                        Some(datagram) => self.dispatch(datagram).await,
                        None => {
                            error!("transport channel closed");
                            break;
                        }
                    }
                }
                payload = self.data_rx.recv() => {
                    if let Some((circuit_id, payload)) = payload {
                        debug!(circuit = circuit_id, bytes = payload.len(), "circuit data");
                        let _ = self.data_events.send((circuit_id, payload));
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        // Tell first hops we are going away before dropping the socket
        for stats in self.manager.list_circuits() {
            self.manager
                .destroy_circuit(stats.id, destroy_reason::SHUTDOWN)
                .await;
        }

        for task in [sweep_task, heartbeat_task, monitor_task]
            .into_iter()
            .chain(relay_tasks)
        {
            task.abort();
        }
        self.transport.shutdown();
        Ok(())
    }

    /// Route one datagram to the handshake engine, the circuit
    /// manager, or the relay role. Malformed input is dropped.
    async fn dispatch(&self, datagram: Datagram) {
        let Datagram { bytes, from } = datagram;
        let msg = match Message::decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("malformed datagram from {from}: {e}");
                return;
            }
        };

        if msg.is_handshake() {
            self.engine.handle(msg, from).await;
            return;
        }

        match msg.kind() {
            // Only a relay ever receives these
            MessageKind::Create | MessageKind::Extend | MessageKind::Ping => {
                match &self.relay {
                    Some(relay) => relay.handle(msg, from).await,
                    None => debug!("relay traffic from {from} but relaying is disabled"),
                }
            }
            // Shared kinds: ours if we originated the circuit,
            // otherwise relayed
            _ => {
                if self.manager.owns(msg.circuit_id()) {
                    self.manager.handle_message(msg, from).await;
                } else if let Some(relay) = &self.relay {
                    relay.handle(msg, from).await;
                } else {
                    debug!(
                        circuit = msg.circuit_id(),
                        "message for unknown circuit from {from}"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::time::{Duration, Instant};

    fn test_config(extra: &[&str]) -> Config {
        let mut args = vec![
            "veild",
            "--listen",
            "127.0.0.1:0",
            "--hops",
            "1",
            "--min-circuits",
            "1",
            "--max-circuits",
            "2",
        ];
        args.extend_from_slice(extra);
        Config::parse_from(args)
    }

    async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_bootstrap_handshake_between_nodes() {
        let relay_node = Node::new(test_config(&["--relay"])).await.unwrap();
        let relay_handle = relay_node.handle();
        let relay_addr = relay_handle.local_addr.to_string();
        tokio::spawn(relay_node.run());

        let client_node = Node::new(test_config(&["--bootstrap", &relay_addr]))
            .await
            .unwrap();
        let client_handle = client_node.handle();
        tokio::spawn(client_node.run());

        // Bootstrap completes in both directions: the client learns
        // the relay from the signed response, the relay learns the
        // client from the request.
        let client_dir = Arc::clone(&client_handle.directory);
        assert!(
            wait_until(Duration::from_secs(3), || {
                client_dir.relay_candidates(1, &[]).len() == 1
            })
            .await,
            "client never registered the relay"
        );
        assert_eq!(relay_handle.directory.len(), 1);

        let _ = relay_handle.shutdown.send(());
        let _ = client_handle.shutdown.send(());
    }

    #[tokio::test]
    async fn test_circuit_echo_through_relay_node() {
        let relay_node = Node::new(test_config(&["--relay"])).await.unwrap();
        let relay_handle = relay_node.handle();
        let relay_addr = relay_handle.local_addr.to_string();
        tokio::spawn(relay_node.run());

        let client_node = Node::new(test_config(&["--bootstrap", &relay_addr]))
            .await
            .unwrap();
        let client_handle = client_node.handle();
        tokio::spawn(client_node.run());

        let client_dir = Arc::clone(&client_handle.directory);
        assert!(
            wait_until(Duration::from_secs(3), || {
                client_dir.relay_candidates(1, &[]).len() == 1
            })
            .await
        );

        // One-hop circuit through the relay; the relay's exit loop
        // echoes whatever terminates there.
        let mut data = client_handle.data.subscribe();
        let id = client_handle.manager.create_circuit(1).await.unwrap();
        client_handle
            .manager
            .send_data(id, b"echo through the overlay")
            .await
            .unwrap();

        let (circuit_id, payload) =
            tokio::time::timeout(Duration::from_secs(3), data.recv())
                .await
                .expect("no echo within deadline")
                .unwrap();
        assert_eq!(circuit_id, id);
        assert_eq!(payload, b"echo through the overlay");

        let _ = relay_handle.shutdown.send(());
        let _ = client_handle.shutdown.send(());
    }

    #[tokio::test]
    async fn test_non_relay_node_drops_relay_traffic() {
        let node = Node::new(test_config(&[])).await.unwrap();
        let handle = node.handle();
        let addr = handle.local_addr;
        tokio::spawn(node.run());

        // A CREATE aimed at a non-relay must be ignored, not answered
        let (probe, mut probe_rx) =
            UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let create = Message::Create {
            circuit_id: 1,
            identifier: 1,
            node_key: [0u8; 32],
            ephemeral_key: [0u8; 32],
        };
        probe.send(&create.encode(), addr).await.unwrap();

        let reply =
            tokio::time::timeout(Duration::from_millis(300), probe_rx.recv()).await;
        assert!(reply.is_err(), "non-relay node must not answer CREATE");

        let _ = handle.shutdown.send(());
    }
}
