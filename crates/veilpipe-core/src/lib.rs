//! veilpipe-core: identity, peer model, and wire codec
//!
//! Leaf crate of the veilpipe tunnel stack. Holds everything the circuit
//! engine needs that involves no I/O: the node's signing identity, the
//! peer/handshake data model, and the binary codec for the circuit and
//! handshake wire protocol.

pub mod identity;
pub mod peer;
pub mod wire;

pub use identity::NetworkIdentity;
pub use peer::{HandshakeState, Peer, PeerId};
pub use wire::{Message, MessageKind, WireError, PROTOCOL_VERSION};
