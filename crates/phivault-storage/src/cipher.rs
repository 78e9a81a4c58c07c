//! Authenticated encryption of byte buffers into self-describing envelopes.
//!
//! Layout: `[nonce_len: u8][nonce][ciphertext || 16-byte tag]`, AES-256-GCM with a
//! fresh random nonce per call.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use phivault_core::{Result, VaultError};
use rand::RngCore;
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Sealed bytes as persisted to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope(Vec<u8>);

impl Envelope {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn nonce(&self) -> Result<&[u8]> {
        split(&self.0).map(|(nonce, _)| nonce)
    }

    /// Ciphertext followed by the authentication tag.
    pub fn body(&self) -> Result<&[u8]> {
        split(&self.0).map(|(_, body)| body)
    }
}

impl AsRef<[u8]> for Envelope {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Fresh 256-bit key from the OS RNG.
pub fn generate_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut *key);
    key
}

pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Result<Envelope> {
    let cipher = build_cipher(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| VaultError::io(format!("encrypt failed: {e}")))?;

    let mut out = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
    out.push(NONCE_LEN as u8);
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&sealed);
    Ok(Envelope(out))
}

pub fn decrypt(envelope: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
    let (nonce, body) = split(envelope)?;
    let cipher = build_cipher(key)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| VaultError::IntegrityFailure)
}

fn split(bytes: &[u8]) -> Result<(&[u8], &[u8])> {
    let (&declared, rest) = bytes
        .split_first()
        .ok_or_else(|| VaultError::format("envelope is empty"))?;
    let declared = declared as usize;
    if rest.len() < declared {
        return Err(VaultError::format(format!(
            "declared nonce length {declared} exceeds envelope size {}",
            bytes.len()
        )));
    }
    if declared != NONCE_LEN {
        return Err(VaultError::format(format!(
            "unsupported nonce length {declared}"
        )));
    }
    let (nonce, body) = rest.split_at(declared);
    if body.len() < TAG_LEN {
        return Err(VaultError::format("ciphertext shorter than tag"));
    }
    Ok((nonce, body))
}

fn build_cipher(key: &[u8; KEY_LEN]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|e| VaultError::io(format!("cipher init failed: {e}")))
}
