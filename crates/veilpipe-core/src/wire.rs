//! Binary wire codec for circuit and handshake messages
//!
//! Wire format:
//! - first 4 bytes: circuit ID (or request identifier for pre-circuit
//!   messages), big-endian
//! - 1 byte: message kind
//! - body fields in order, all multi-byte integers big-endian
//! - variable-length fields carry a 2-byte big-endian length prefix,
//!   no inter-field padding
//! - 32-byte cryptographic keys are length-prefixed and must be exactly
//!   32 bytes; signatures are exactly 64 bytes
//!
//! Handshake messages end with a 64-byte Ed25519 signature over every
//! preceding byte. Malformed input is reported as `WireError` and never
//! panics; callers drop malformed datagrams.

use crate::identity::NetworkIdentity;
use bytes::{BufMut, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

/// Upper bound on any serialized message; larger input is rejected
/// before field parsing.
pub const MAX_MESSAGE_SIZE: usize = 2048;

/// Length of an Ed25519 signature
pub const SIGNATURE_LEN: usize = 64;

/// Protocol version advertised in introduction messages
pub const PROTOCOL_VERSION: u16 = 1;

/// Codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("message too large: {0} bytes")]
    Oversized(usize),
    #[error("unknown message kind: {0}")]
    UnknownKind(u8),
    #[error("bad length for {field}: {got}")]
    BadFieldLength { field: &'static str, got: usize },
    #[error("trailing bytes after message")]
    TrailingBytes,
}

/// Message kind discriminants
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Create = 1,
    Created = 2,
    Extend = 3,
    Extended = 4,
    Destroy = 5,
    Data = 6,
    Ping = 7,
    Pong = 8,
    IntroductionRequest = 20,
    IntroductionResponse = 21,
    PunctureRequest = 22,
    Puncture = 23,
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Create),
            2 => Ok(Self::Created),
            3 => Ok(Self::Extend),
            4 => Ok(Self::Extended),
            5 => Ok(Self::Destroy),
            6 => Ok(Self::Data),
            7 => Ok(Self::Ping),
            8 => Ok(Self::Pong),
            20 => Ok(Self::IntroductionRequest),
            21 => Ok(Self::IntroductionResponse),
            22 => Ok(Self::PunctureRequest),
            23 => Ok(Self::Puncture),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Every message exchanged with relays and peers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Open the first hop of a circuit
    Create {
        circuit_id: u32,
        identifier: u16,
        node_key: [u8; 32],
        ephemeral_key: [u8; 32],
    },
    /// First-hop response with the relay's ephemeral key
    Created {
        circuit_id: u32,
        identifier: u16,
        ephemeral_key: [u8; 32],
        auth: Vec<u8>,
        candidates: Vec<SocketAddrV4>,
    },
    /// Extend an existing circuit by one hop
    Extend {
        circuit_id: u32,
        identifier: u16,
        node_key: [u8; 32],
        addr: SocketAddrV4,
        ephemeral_key: [u8; 32],
    },
    /// Extension response relayed back to the initiator
    Extended {
        circuit_id: u32,
        identifier: u16,
        ephemeral_key: [u8; 32],
        auth: Vec<u8>,
        candidates: Vec<SocketAddrV4>,
    },
    /// Tear down a circuit
    Destroy { circuit_id: u32, reason: u8 },
    /// Onion-wrapped application bytes
    Data { circuit_id: u32, payload: Vec<u8> },
    /// Circuit keepalive
    Ping { circuit_id: u32, identifier: u16 },
    /// Keepalive response from the terminal relay
    Pong { circuit_id: u32, identifier: u16 },
    /// Handshake step 1: signed introduction
    IntroductionRequest {
        identifier: u32,
        public_key: [u8; 32],
        source: SocketAddrV4,
        version: u16,
        signature: [u8; 64],
    },
    /// Handshake step 2: signed response, possibly requesting a puncture
    IntroductionResponse {
        identifier: u32,
        public_key: [u8; 32],
        version: u16,
        puncture_needed: bool,
        intermediary: SocketAddrV4,
        signature: [u8; 64],
    },
    /// Handshake step 3: ask the intermediary to punch a hole
    PunctureRequest {
        identifier: u32,
        public_key: [u8; 32],
        target: SocketAddrV4,
        signature: [u8; 64],
    },
    /// Handshake step 4: the punched datagram itself
    Puncture {
        identifier: u32,
        public_key: [u8; 32],
        signature: [u8; 64],
    },
}

impl Message {
    /// Kind discriminant
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Create { .. } => MessageKind::Create,
            Self::Created { .. } => MessageKind::Created,
            Self::Extend { .. } => MessageKind::Extend,
            Self::Extended { .. } => MessageKind::Extended,
            Self::Destroy { .. } => MessageKind::Destroy,
            Self::Data { .. } => MessageKind::Data,
            Self::Ping { .. } => MessageKind::Ping,
            Self::Pong { .. } => MessageKind::Pong,
            Self::IntroductionRequest { .. } => MessageKind::IntroductionRequest,
            Self::IntroductionResponse { .. } => MessageKind::IntroductionResponse,
            Self::PunctureRequest { .. } => MessageKind::PunctureRequest,
            Self::Puncture { .. } => MessageKind::Puncture,
        }
    }

    /// The leading 4-byte identifier: circuit ID for circuit messages,
    /// request identifier for handshake messages.
    pub fn circuit_id(&self) -> u32 {
        match self {
            Self::Create { circuit_id, .. }
            | Self::Created { circuit_id, .. }
            | Self::Extend { circuit_id, .. }
            | Self::Extended { circuit_id, .. }
            | Self::Destroy { circuit_id, .. }
            | Self::Data { circuit_id, .. }
            | Self::Ping { circuit_id, .. }
            | Self::Pong { circuit_id, .. } => *circuit_id,
            Self::IntroductionRequest { identifier, .. }
            | Self::IntroductionResponse { identifier, .. }
            | Self::PunctureRequest { identifier, .. }
            | Self::Puncture { identifier, .. } => *identifier,
        }
    }

    /// Whether this is one of the four signed handshake messages
    pub fn is_handshake(&self) -> bool {
        matches!(
            self.kind(),
            MessageKind::IntroductionRequest
                | MessageKind::IntroductionResponse
                | MessageKind::PunctureRequest
                | MessageKind::Puncture
        )
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u32(self.circuit_id());
        buf.put_u8(self.kind() as u8);
        self.encode_body(&mut buf);
        if let Some(sig) = self.signature() {
            buf.put_slice(&sig);
        }
        buf.to_vec()
    }

    /// The bytes a handshake signature covers: the full serialization
    /// minus the trailing signature. `None` for circuit messages.
    pub fn signing_payload(&self) -> Option<Vec<u8>> {
        if !self.is_handshake() {
            return None;
        }
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u32(self.circuit_id());
        buf.put_u8(self.kind() as u8);
        self.encode_body(&mut buf);
        Some(buf.to_vec())
    }

    /// Sign a handshake message in place; circuit messages pass through.
    pub fn sign(mut self, identity: &NetworkIdentity) -> Self {
        if let Some(payload) = self.signing_payload() {
            let sig = identity.sign(&payload);
            match &mut self {
                Self::IntroductionRequest { signature, .. }
                | Self::IntroductionResponse { signature, .. }
                | Self::PunctureRequest { signature, .. }
                | Self::Puncture { signature, .. } => *signature = sig,
                _ => unreachable!("signing_payload is Some only for handshake kinds"),
            }
        }
        self
    }

    /// Verify a handshake signature against the embedded public key.
    /// Circuit messages report `false`.
    pub fn verify_signature(&self) -> bool {
        let (public_key, signature) = match self {
            Self::IntroductionRequest {
                public_key,
                signature,
                ..
            }
            | Self::IntroductionResponse {
                public_key,
                signature,
                ..
            }
            | Self::PunctureRequest {
                public_key,
                signature,
                ..
            }
            | Self::Puncture {
                public_key,
                signature,
                ..
            } => (public_key, signature),
            _ => return false,
        };
        let Some(payload) = self.signing_payload() else {
            return false;
        };
        NetworkIdentity::verify(public_key, &payload, signature).is_ok()
    }

    /// Sender public key for handshake messages
    pub fn sender_key(&self) -> Option<[u8; 32]> {
        match self {
            Self::IntroductionRequest { public_key, .. }
            | Self::IntroductionResponse { public_key, .. }
            | Self::PunctureRequest { public_key, .. }
            | Self::Puncture { public_key, .. } => Some(*public_key),
            _ => None,
        }
    }

    fn signature(&self) -> Option<[u8; 64]> {
        match self {
            Self::IntroductionRequest { signature, .. }
            | Self::IntroductionResponse { signature, .. }
            | Self::PunctureRequest { signature, .. }
            | Self::Puncture { signature, .. } => Some(*signature),
            _ => None,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Self::Create {
                identifier,
                node_key,
                ephemeral_key,
                ..
            } => {
                buf.put_u16(*identifier);
                put_key(buf, node_key);
                put_key(buf, ephemeral_key);
            }
            Self::Created {
                identifier,
                ephemeral_key,
                auth,
                candidates,
                ..
            }
            | Self::Extended {
                identifier,
                ephemeral_key,
                auth,
                candidates,
                ..
            } => {
                buf.put_u16(*identifier);
                put_key(buf, ephemeral_key);
                put_var(buf, auth);
                put_candidates(buf, candidates);
            }
            Self::Extend {
                identifier,
                node_key,
                addr,
                ephemeral_key,
                ..
            } => {
                buf.put_u16(*identifier);
                put_key(buf, node_key);
                put_addr(buf, addr);
                put_key(buf, ephemeral_key);
            }
            Self::Destroy { reason, .. } => {
                buf.put_u8(*reason);
            }
            Self::Data { payload, .. } => {
                put_var(buf, payload);
            }
            Self::Ping { identifier, .. } | Self::Pong { identifier, .. } => {
                buf.put_u16(*identifier);
            }
            Self::IntroductionRequest {
                public_key,
                source,
                version,
                ..
            } => {
                put_key(buf, public_key);
                put_addr(buf, source);
                buf.put_u16(*version);
            }
            Self::IntroductionResponse {
                public_key,
                version,
                puncture_needed,
                intermediary,
                ..
            } => {
                put_key(buf, public_key);
                buf.put_u16(*version);
                buf.put_u8(u8::from(*puncture_needed));
                put_addr(buf, intermediary);
            }
            Self::PunctureRequest {
                public_key, target, ..
            } => {
                put_key(buf, public_key);
                put_addr(buf, target);
            }
            Self::Puncture { public_key, .. } => {
                put_key(buf, public_key);
            }
        }
    }

    /// Parse wire bytes. Rejects truncated, oversized and malformed
    /// input without panicking.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::Oversized(bytes.len()));
        }
        let mut r = Reader::new(bytes);
        let circuit_id = r.u32()?;
        let kind = MessageKind::try_from(r.u8()?)?;

        let msg = match kind {
            MessageKind::Create => Message::Create {
                circuit_id,
                identifier: r.u16()?,
                node_key: r.key("node_key")?,
                ephemeral_key: r.key("ephemeral_key")?,
            },
            MessageKind::Created => Message::Created {
                circuit_id,
                identifier: r.u16()?,
                ephemeral_key: r.key("ephemeral_key")?,
                auth: r.var()?,
                candidates: r.candidates()?,
            },
            MessageKind::Extend => Message::Extend {
                circuit_id,
                identifier: r.u16()?,
                node_key: r.key("node_key")?,
                addr: r.addr()?,
                ephemeral_key: r.key("ephemeral_key")?,
            },
            MessageKind::Extended => Message::Extended {
                circuit_id,
                identifier: r.u16()?,
                ephemeral_key: r.key("ephemeral_key")?,
                auth: r.var()?,
                candidates: r.candidates()?,
            },
            MessageKind::Destroy => Message::Destroy {
                circuit_id,
                reason: r.u8()?,
            },
            MessageKind::Data => Message::Data {
                circuit_id,
                payload: r.var()?,
            },
            MessageKind::Ping => Message::Ping {
                circuit_id,
                identifier: r.u16()?,
            },
            MessageKind::Pong => Message::Pong {
                circuit_id,
                identifier: r.u16()?,
            },
            MessageKind::IntroductionRequest => Message::IntroductionRequest {
                identifier: circuit_id,
                public_key: r.key("public_key")?,
                source: r.addr()?,
                version: r.u16()?,
                signature: r.signature()?,
            },
            MessageKind::IntroductionResponse => Message::IntroductionResponse {
                identifier: circuit_id,
                public_key: r.key("public_key")?,
                version: r.u16()?,
                puncture_needed: r.u8()? != 0,
                intermediary: r.addr()?,
                signature: r.signature()?,
            },
            MessageKind::PunctureRequest => Message::PunctureRequest {
                identifier: circuit_id,
                public_key: r.key("public_key")?,
                target: r.addr()?,
                signature: r.signature()?,
            },
            MessageKind::Puncture => Message::Puncture {
                identifier: circuit_id,
                public_key: r.key("public_key")?,
                signature: r.signature()?,
            },
        };

        r.finish()?;
        Ok(msg)
    }
}

fn put_var(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn put_key(buf: &mut BytesMut, key: &[u8; 32]) {
    put_var(buf, key);
}

fn put_addr(buf: &mut BytesMut, addr: &SocketAddrV4) {
    buf.put_slice(&addr.ip().octets());
    buf.put_u16(addr.port());
}

fn put_candidates(buf: &mut BytesMut, candidates: &[SocketAddrV4]) {
    buf.put_u16((candidates.len() * 6) as u16);
    for addr in candidates {
        put_addr(buf, addr);
    }
}

/// Bounds-checked cursor over a received datagram
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() - self.pos < n {
            return Err(WireError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn var(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn key(&mut self, field: &'static str) -> Result<[u8; 32], WireError> {
        let len = self.u16()? as usize;
        if len != 32 {
            return Err(WireError::BadFieldLength { field, got: len });
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(self.take(32)?);
        Ok(key)
    }

    fn addr(&mut self) -> Result<SocketAddrV4, WireError> {
        let b = self.take(4)?;
        let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
        let port = self.u16()?;
        Ok(SocketAddrV4::new(ip, port))
    }

    fn candidates(&mut self) -> Result<Vec<SocketAddrV4>, WireError> {
        let len = self.u16()? as usize;
        if len % 6 != 0 {
            return Err(WireError::BadFieldLength {
                field: "candidates",
                got: len,
            });
        }
        let mut out = Vec::with_capacity(len / 6);
        let mut remaining = len;
        while remaining > 0 {
            out.push(self.addr()?);
            remaining -= 6;
        }
        Ok(out)
    }

    fn signature(&mut self) -> Result<[u8; 64], WireError> {
        let mut sig = [0u8; 64];
        sig.copy_from_slice(self.take(SIGNATURE_LEN)?);
        Ok(sig)
    }

    fn finish(&self) -> Result<(), WireError> {
        if self.pos != self.buf.len() {
            return Err(WireError::TrailingBytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port)
    }

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Create {
                circuit_id: 0x12345678,
                identifier: 0xABCD,
                node_key: [1u8; 32],
                ephemeral_key: [2u8; 32],
            },
            Message::Created {
                circuit_id: 7,
                identifier: 9,
                ephemeral_key: [3u8; 32],
                auth: vec![0xAA; 32],
                candidates: vec![addr(9000), addr(9001)],
            },
            Message::Extend {
                circuit_id: 42,
                identifier: 1,
                node_key: [4u8; 32],
                addr: addr(7000),
                ephemeral_key: [5u8; 32],
            },
            Message::Extended {
                circuit_id: 42,
                identifier: 1,
                ephemeral_key: [6u8; 32],
                auth: vec![1, 2, 3],
                candidates: vec![],
            },
            Message::Destroy {
                circuit_id: 99,
                reason: 2,
            },
            Message::Data {
                circuit_id: 100,
                payload: vec![9; 128],
            },
            Message::Ping {
                circuit_id: 5,
                identifier: 77,
            },
            Message::Pong {
                circuit_id: 5,
                identifier: 77,
            },
            Message::IntroductionRequest {
                identifier: 0xDEADBEEF,
                public_key: [7u8; 32],
                source: addr(8000),
                version: PROTOCOL_VERSION,
                signature: [8u8; 64],
            },
            Message::IntroductionResponse {
                identifier: 0xDEADBEEF,
                public_key: [9u8; 32],
                version: PROTOCOL_VERSION,
                puncture_needed: true,
                intermediary: addr(8001),
                signature: [10u8; 64],
            },
            Message::PunctureRequest {
                identifier: 3,
                public_key: [11u8; 32],
                target: addr(8002),
                signature: [12u8; 64],
            },
            Message::Puncture {
                identifier: 3,
                public_key: [13u8; 32],
                signature: [14u8; 64],
            },
        ]
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        for msg in sample_messages() {
            let bytes = msg.encode();
            let decoded = Message::decode(&bytes).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_circuit_id_is_first_four_bytes_big_endian() {
        for msg in sample_messages() {
            let bytes = msg.encode();
            let leading = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            assert_eq!(leading, msg.circuit_id());
        }
    }

    #[test]
    fn test_truncated_rejected() {
        for msg in sample_messages() {
            let bytes = msg.encode();
            for cut in 0..bytes.len() {
                assert!(
                    Message::decode(&bytes[..cut]).is_err(),
                    "prefix of length {cut} decoded for {:?}",
                    msg.kind()
                );
            }
        }
    }

    #[test]
    fn test_oversized_var_field_rejected() {
        // DATA claiming a 500-byte payload but carrying 4
        let mut bytes = vec![];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.push(MessageKind::Data as u8);
        bytes.extend_from_slice(&500u16.to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(Message::decode(&bytes), Err(WireError::Truncated));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let bytes = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            Message::decode(&bytes),
            Err(WireError::Oversized(_))
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.push(0xFF);
        assert_eq!(Message::decode(&bytes), Err(WireError::UnknownKind(0xFF)));
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        // CREATE with a 31-byte node key
        let mut bytes = vec![];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.push(MessageKind::Create as u8);
        bytes.extend_from_slice(&7u16.to_be_bytes());
        bytes.extend_from_slice(&31u16.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 31]);
        assert!(matches!(
            Message::decode(&bytes),
            Err(WireError::BadFieldLength {
                field: "node_key",
                got: 31
            })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Message::Destroy {
            circuit_id: 1,
            reason: 0,
        }
        .encode();
        bytes.push(0);
        assert_eq!(Message::decode(&bytes), Err(WireError::TrailingBytes));
    }

    #[test]
    fn test_candidate_list_length_must_be_multiple_of_six() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.push(MessageKind::Created as u8);
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(&32u16.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 32]);
        bytes.extend_from_slice(&0u16.to_be_bytes()); // empty auth
        bytes.extend_from_slice(&5u16.to_be_bytes()); // bad candidate blob
        bytes.extend_from_slice(&[0u8; 5]);
        assert!(matches!(
            Message::decode(&bytes),
            Err(WireError::BadFieldLength {
                field: "candidates",
                ..
            })
        ));
    }

    #[test]
    fn test_signature_excluded_from_signed_payload() {
        use crate::identity::NetworkIdentity;

        let identity = NetworkIdentity::from_seed(&[1u8; 32]);
        let msg = Message::IntroductionRequest {
            identifier: 11,
            public_key: identity.public_key(),
            source: addr(8000),
            version: PROTOCOL_VERSION,
            signature: [0u8; 64],
        }
        .sign(&identity);

        let bytes = msg.encode();
        let payload = msg.signing_payload().unwrap();
        assert_eq!(&bytes[..bytes.len() - SIGNATURE_LEN], &payload[..]);
        assert!(msg.verify_signature());

        // Flipping a body byte invalidates the signature
        let mut tampered = bytes.clone();
        tampered[7] ^= 1;
        let tampered = Message::decode(&tampered).unwrap();
        assert!(!tampered.verify_signature());
    }

    #[test]
    fn test_circuit_messages_have_no_signing_payload() {
        let msg = Message::Ping {
            circuit_id: 1,
            identifier: 2,
        };
        assert!(msg.signing_payload().is_none());
        assert!(!msg.verify_signature());
    }
}
