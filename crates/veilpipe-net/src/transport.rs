//! UDP datagram transport
//!
//! Thin wrapper around a tokio UDP socket: a spawned recv loop delivers
//! inbound datagrams over a channel, sends are bounded by the effective
//! path MTU (the circuit layer never fragments).

use parking_lot::Mutex;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Effective path MTU for UDP payloads
pub const MAX_DATAGRAM_SIZE: usize = 1472;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload exceeds path MTU: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("transport closed")]
    Closed,
}

/// An inbound datagram
#[derive(Debug)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub from: SocketAddrV4,
}

/// UDP transport bound to a local IPv4 socket
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddrV4,
    recv_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind a socket and start the recv loop. Inbound datagrams arrive
    /// on the returned channel.
    pub async fn bind(
        addr: SocketAddrV4,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Datagram>), TransportError> {
        let socket = Arc::new(UdpSocket::bind(SocketAddr::V4(addr)).await?);
        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(a) => {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    format!("bound to IPv6 address {a}"),
                )))
            }
        };

        let (tx, rx) = mpsc::channel(256);
        let recv_socket = Arc::clone(&socket);
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, SocketAddr::V4(from))) => {
                        let datagram = Datagram {
                            bytes: buf[..len].to_vec(),
                            from,
                        };
                        if tx.send(datagram).await.is_err() {
                            break;
                        }
                    }
                    Ok((_, SocketAddr::V6(from))) => {
                        debug!("dropping datagram from IPv6 source {}", from);
                    }
                    Err(e) => {
                        warn!("recv error: {}", e);
                    }
                }
            }
        });

        let transport = Arc::new(Self {
            socket,
            local_addr,
            recv_task: Mutex::new(Some(recv_task)),
        });
        Ok((transport, rx))
    }

    /// Local socket address
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// Send one datagram. Payloads above the path MTU are rejected,
    /// never fragmented.
    pub async fn send(&self, payload: &[u8], to: SocketAddrV4) -> Result<(), TransportError> {
        if payload.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }
        self.socket.send_to(payload, SocketAddr::V4(to)).await?;
        Ok(())
    }

    /// Send with exponential backoff on IO failure, bounded attempts.
    /// MTU violations are permanent and never retried.
    pub async fn send_with_retry(
        &self,
        payload: &[u8],
        to: SocketAddrV4,
        attempts: u32,
        base_delay: Duration,
    ) -> Result<(), TransportError> {
        let mut delay = base_delay;
        let mut last = TransportError::Closed;
        for attempt in 0..attempts.max(1) {
            match self.send(payload, to).await {
                Ok(()) => return Ok(()),
                Err(e @ TransportError::PayloadTooLarge(_)) => return Err(e),
                Err(e) => {
                    debug!("send to {} failed (attempt {}): {}", to, attempt + 1, e);
                    last = e;
                }
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        Err(last)
    }

    /// Stop the recv loop
    pub fn shutdown(&self) {
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn any_addr() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
    }

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let (a, _a_rx) = UdpTransport::bind(any_addr()).await.unwrap();
        let (b, mut b_rx) = UdpTransport::bind(any_addr()).await.unwrap();

        a.send(b"hello", b.local_addr()).await.unwrap();

        let datagram = b_rx.recv().await.unwrap();
        assert_eq!(datagram.bytes, b"hello");
        assert_eq!(datagram.from, a.local_addr());
    }

    #[tokio::test]
    async fn test_mtu_enforced() {
        let (a, _rx) = UdpTransport::bind(any_addr()).await.unwrap();
        let oversized = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(
            a.send(&oversized, a.local_addr()).await,
            Err(TransportError::PayloadTooLarge(_))
        ));

        // And never retried
        assert!(matches!(
            a.send_with_retry(&oversized, a.local_addr(), 3, Duration::from_millis(1))
                .await,
            Err(TransportError::PayloadTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_exact_mtu_accepted() {
        let (a, _a_rx) = UdpTransport::bind(any_addr()).await.unwrap();
        let (b, mut b_rx) = UdpTransport::bind(any_addr()).await.unwrap();

        let payload = vec![7u8; MAX_DATAGRAM_SIZE];
        a.send(&payload, b.local_addr()).await.unwrap();
        let datagram = b_rx.recv().await.unwrap();
        assert_eq!(datagram.bytes.len(), MAX_DATAGRAM_SIZE);
    }
}
