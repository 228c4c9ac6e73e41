//! Layered (onion) encryption
//!
//! One authenticated layer per hop, keyed by the hop's derived symmetric
//! key. The nearest hop's layer is outermost: it strips one layer and
//! forwards the remainder without learning downstream content. Every
//! layer uses a fresh random 96-bit nonce, prepended to the ciphertext,
//! so ciphertext grows by nonce + tag per layer.

use crate::crypto::HopKey;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Bytes added per encryption layer (nonce + Poly1305 tag)
pub const LAYER_OVERHEAD: usize = 12 + 16;

/// Onion cipher errors
#[derive(Debug, Error)]
pub enum OnionError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("ciphertext too short: {0} bytes")]
    TooShort(usize),
    #[error("no hop keys")]
    NoKeys,
}

/// Encrypt one layer for a single hop
pub fn encrypt_for_hop(key: &HopKey, plaintext: &[u8]) -> Result<Vec<u8>, OnionError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| OnionError::EncryptionFailed)?;

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| OnionError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Remove one layer from a single hop
pub fn decrypt_from_hop(key: &HopKey, data: &[u8]) -> Result<Vec<u8>, OnionError> {
    if data.len() < LAYER_OVERHEAD {
        return Err(OnionError::TooShort(data.len()));
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| OnionError::DecryptionFailed)?;

    let nonce = Nonce::from_slice(&data[..12]);
    cipher
        .decrypt(nonce, &data[12..])
        .map_err(|_| OnionError::DecryptionFailed)
}

/// Wrap a payload in one layer per hop key, nearest hop (index 0)
/// outermost.
pub fn encrypt_layers(keys: &[HopKey], plaintext: &[u8]) -> Result<Vec<u8>, OnionError> {
    if keys.is_empty() {
        return Err(OnionError::NoKeys);
    }
    let mut data = plaintext.to_vec();
    for key in keys.iter().rev() {
        data = encrypt_for_hop(key, &data)?;
    }
    Ok(data)
}

/// Peel every layer, nearest hop first
pub fn decrypt_layers(keys: &[HopKey], data: &[u8]) -> Result<Vec<u8>, OnionError> {
    if keys.is_empty() {
        return Err(OnionError::NoKeys);
    }
    let mut data = data.to_vec();
    for key in keys {
        data = decrypt_from_hop(key, &data)?;
    }
    Ok(data)
}
