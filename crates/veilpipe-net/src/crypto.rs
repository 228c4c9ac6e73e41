//! Per-hop key agreement
//!
//! Each hop gets an ephemeral X25519 exchange; the shared secret is
//! expanded with HKDF-SHA256 into the hop's symmetric key plus a
//! key-confirmation tag carried in CREATED/EXTENDED. The ephemeral
//! private half is consumed by the Diffie-Hellman step and never
//! outlives it.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, SharedSecret};

/// Crypto errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed")]
    KeyDerivationFailed,
    #[error("key confirmation mismatch")]
    KeyConfirmationMismatch,
}

/// Symmetric key for one hop; zeroed on drop.
pub struct HopKey([u8; 32]);

impl HopKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for HopKey {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

impl std::fmt::Debug for HopKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HopKey(..)")
    }
}

/// One-shot X25519 ephemeral exchange
pub struct EphemeralExchange {
    secret: EphemeralSecret,
    public: X25519Public,
}

impl EphemeralExchange {
    /// Generate a fresh ephemeral keypair
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    /// Public half, as sent on the wire
    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Consume the private half and produce the shared secret
    pub fn complete(self, their_public: &[u8; 32]) -> SharedSecret {
        let their_public = X25519Public::from(*their_public);
        self.secret.diffie_hellman(&their_public)
    }
}

impl Default for EphemeralExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand a hop's shared secret into (symmetric key, confirmation tag).
///
/// Both sides pass the ephemeral publics in initiator/responder order so
/// the derivation is direction-independent.
pub fn derive_hop_secret(
    shared: &SharedSecret,
    initiator_eph: &[u8; 32],
    responder_eph: &[u8; 32],
) -> Result<(HopKey, [u8; 32]), CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());

    let mut key_info = Vec::with_capacity(19 + 64);
    key_info.extend_from_slice(b"veilpipe-hop-key-v1");
    key_info.extend_from_slice(initiator_eph);
    key_info.extend_from_slice(responder_eph);

    let mut auth_info = Vec::with_capacity(20 + 64);
    auth_info.extend_from_slice(b"veilpipe-hop-auth-v1");
    auth_info.extend_from_slice(initiator_eph);
    auth_info.extend_from_slice(responder_eph);

    let mut key = [0u8; 32];
    hkdf.expand(&key_info, &mut key)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;

    let mut auth = [0u8; 32];
    hkdf.expand(&auth_info, &mut auth)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;

    Ok((HopKey(key), auth))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_same_secret() {
        let initiator = EphemeralExchange::new();
        let responder = EphemeralExchange::new();
        let i_pub = initiator.public_key();
        let r_pub = responder.public_key();

        let i_shared = initiator.complete(&r_pub);
        let r_shared = responder.complete(&i_pub);

        let (i_key, i_auth) = derive_hop_secret(&i_shared, &i_pub, &r_pub).unwrap();
        let (r_key, r_auth) = derive_hop_secret(&r_shared, &i_pub, &r_pub).unwrap();

        assert_eq!(i_key.as_bytes(), r_key.as_bytes());
        assert_eq!(i_auth, r_auth);
    }

    #[test]
    fn test_key_and_auth_differ() {
        let a = EphemeralExchange::new();
        let b = EphemeralExchange::new();
        let a_pub = a.public_key();
        let b_pub = b.public_key();
        let shared = a.complete(&b_pub);

        let (key, auth) = derive_hop_secret(&shared, &a_pub, &b_pub).unwrap();
        assert_ne!(key.as_bytes(), &auth);
    }

    #[test]
    fn test_distinct_exchanges_distinct_keys() {
        let responder_pub = EphemeralExchange::new().public_key();

        let a = EphemeralExchange::new();
        let a_pub = a.public_key();
        let (key_a, _) =
            derive_hop_secret(&a.complete(&responder_pub), &a_pub, &responder_pub).unwrap();

        let b = EphemeralExchange::new();
        let b_pub = b.public_key();
        let (key_b, _) =
            derive_hop_secret(&b.complete(&responder_pub), &b_pub, &responder_pub).unwrap();

        assert_ne!(key_a.as_bytes(), key_b.as_bytes());
    }
}
