//! veild - anonymous circuit daemon
//!
//! This daemon provides:
//! - Signed peer introduction and NAT traversal
//! - Multi-hop onion circuits over UDP
//! - Relay service for other nodes' circuits
//! - A warm circuit pool with health monitoring

pub mod config;
pub mod node;

pub use config::Config;
pub use node::{Node, NodeHandle};
