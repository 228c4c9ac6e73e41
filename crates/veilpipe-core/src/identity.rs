//! Node identity: Ed25519 keypair and derived peer ID
//!
//! Created once per node and injected into every component that signs
//! or verifies; there is no ambient instance.

use crate::peer::PeerId;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

/// Identity errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    SignatureVerificationFailed,
}

/// Long-lived signing identity of the local node
#[derive(Clone)]
pub struct NetworkIdentity {
    signing_key: SigningKey,
}

impl NetworkIdentity {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Ed25519 public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Derived peer ID (SHA-1 of the public key)
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature against a public key
    pub fn verify(
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8; 64],
    ) -> Result<(), IdentityError> {
        let verifying_key =
            VerifyingKey::from_bytes(public_key).map_err(|_| IdentityError::InvalidPublicKey)?;
        let sig = Signature::from_bytes(signature);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| IdentityError::SignatureVerificationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let identity = NetworkIdentity::generate();
        let msg = b"introduction-request";
        let sig = identity.sign(msg);

        assert!(NetworkIdentity::verify(&identity.public_key(), msg, &sig).is_ok());
        assert!(NetworkIdentity::verify(&identity.public_key(), b"tampered", &sig).is_err());
    }

    #[test]
    fn test_peer_id_matches_public_key() {
        let identity = NetworkIdentity::from_seed(&[9u8; 32]);
        assert_eq!(
            identity.peer_id(),
            PeerId::from_public_key(&identity.public_key())
        );
    }

    #[test]
    fn test_deterministic_from_seed() {
        let a = NetworkIdentity::from_seed(&[3u8; 32]);
        let b = NetworkIdentity::from_seed(&[3u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
    }
}
