//! Shared fixtures: an in-process relay speaking the real wire
//! protocol and a wired-up manager harness.

use crate::crypto::{derive_hop_secret, EphemeralExchange, HopKey};
use crate::directory::PeerTable;
use crate::manager::CircuitManager;
use crate::onion;
use crate::settings::TunnelSettings;
use crate::transport::{Datagram, UdpTransport};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use veilpipe_core::peer::HandshakeState;
use veilpipe_core::wire::Message;

pub(crate) fn any_addr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
}

pub(crate) struct TestRelay {
    pub addr: SocketAddrV4,
    pub task: tokio::task::JoinHandle<()>,
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Relay that answers CREATE and EXTEND itself (standing in for a whole
/// chain), echoes DATA, and answers PING.
pub(crate) async fn spawn_test_relay() -> TestRelay {
    let (transport, mut rx) = UdpTransport::bind(any_addr()).await.unwrap();
    let addr = transport.local_addr();
    let task = tokio::spawn(async move {
        let mut keys: HashMap<u32, Vec<HopKey>> = HashMap::new();
        while let Some(Datagram { bytes, from }) = rx.recv().await {
            let Ok(msg) = Message::decode(&bytes) else {
                continue;
            };
            let extend = matches!(msg, Message::Extend { .. });
            match msg {
                Message::Create {
                    circuit_id,
                    identifier,
                    ephemeral_key,
                    ..
                }
                | Message::Extend {
                    circuit_id,
                    identifier,
                    ephemeral_key,
                    ..
                } => {
                    let exchange = EphemeralExchange::new();
                    let our_pub = exchange.public_key();
                    let shared = exchange.complete(&ephemeral_key);
                    let (key, auth) =
                        derive_hop_secret(&shared, &ephemeral_key, &our_pub).unwrap();
                    keys.entry(circuit_id).or_default().push(key);

                    let reply = if extend {
                        Message::Extended {
                            circuit_id,
                            identifier,
                            ephemeral_key: our_pub,
                            auth: auth.to_vec(),
                            candidates: vec![],
                        }
                    } else {
                        Message::Created {
                            circuit_id,
                            identifier,
                            ephemeral_key: our_pub,
                            auth: auth.to_vec(),
                            candidates: vec![],
                        }
                    };
                    let _ = transport.send(&reply.encode(), from).await;
                }
                Message::Data {
                    circuit_id,
                    payload,
                } => {
                    let Some(chain) = keys.get(&circuit_id) else {
                        continue;
                    };
                    let mut data = payload;
                    for key in chain {
                        data = onion::decrypt_from_hop(key, &data).unwrap();
                    }
                    let mut out = data;
                    for key in chain.iter().rev() {
                        out = onion::encrypt_for_hop(key, &out).unwrap();
                    }
                    let reply = Message::Data {
                        circuit_id,
                        payload: out,
                    };
                    let _ = transport.send(&reply.encode(), from).await;
                }
                Message::Ping {
                    circuit_id,
                    identifier,
                } => {
                    let reply = Message::Pong {
                        circuit_id,
                        identifier,
                    };
                    let _ = transport.send(&reply.encode(), from).await;
                }
                Message::Destroy { circuit_id, .. } => {
                    keys.remove(&circuit_id);
                }
                _ => {}
            }
        }
    });
    TestRelay { addr, task }
}

/// Register a relay as handshake-complete; higher `successes` sorts
/// earlier in candidate selection.
pub(crate) fn register_relay(
    directory: &PeerTable,
    seed: u8,
    addr: SocketAddrV4,
    successes: u32,
) {
    let id = directory.insert([seed; 32], addr);
    directory.with_peer(&id, |p| {
        p.handshake = HandshakeState::Complete;
        for _ in 0..successes {
            p.record_success(Some(Duration::from_millis(20)));
        }
    });
}

pub(crate) struct ManagerHarness {
    pub manager: Arc<CircuitManager>,
    pub directory: Arc<PeerTable>,
    pub data_rx: mpsc::Receiver<(u32, Vec<u8>)>,
    dispatch: tokio::task::JoinHandle<()>,
}

impl Drop for ManagerHarness {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

/// Manager with its inbound datagrams dispatched from a live socket
pub(crate) async fn manager_harness(settings: TunnelSettings) -> ManagerHarness {
    let (transport, mut rx) = UdpTransport::bind(any_addr()).await.unwrap();
    let directory = Arc::new(PeerTable::new(
        settings.max_peers,
        settings.min_relay_score,
        settings.max_relay_rtt,
    ));
    let (manager, data_rx) = CircuitManager::new(transport, Arc::clone(&directory), settings);

    let dispatch_manager = Arc::clone(&manager);
    let dispatch = tokio::spawn(async move {
        while let Some(Datagram { bytes, from }) = rx.recv().await {
            if let Ok(msg) = Message::decode(&bytes) {
                dispatch_manager.handle_message(msg, from).await;
            }
        }
    });

    ManagerHarness {
        manager,
        directory,
        data_rx,
        dispatch,
    }
}
