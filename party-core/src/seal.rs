//! Session sealing: per-direction keys from the x25519 shared secret, ChaCha20-Poly1305 frames.
//! Nonce: 64-bit counter per direction; never reused.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use sha2::{Digest, Sha256};

use crate::identity::PeerId;

/// Keys for one side of a session.
#[derive(Clone)]
pub struct SessionKeys {
    pub send: [u8; 32],
    pub recv: [u8; 32],
}

/// Derive the local side's keys. The remote side derives the same pair, swapped.
pub fn derive_session_keys(shared_secret: &[u8; 32], local: PeerId, remote: PeerId) -> SessionKeys {
    SessionKeys {
        send: direction_key(shared_secret, local, remote),
        recv: direction_key(shared_secret, remote, local),
    }
}

fn direction_key(shared_secret: &[u8; 32], from: PeerId, to: PeerId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"party-session-v1");
    hasher.update(shared_secret);
    hasher.update(from.as_bytes());
    hasher.update(to.as_bytes());
    hasher.finalize().into()
}

fn nonce_bytes(counter: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[4..12].copy_from_slice(&counter.to_le_bytes());
    out
}

/// Outbound half: seals frames in order.
pub struct Sealer {
    cipher: ChaCha20Poly1305,
    nonce: u64,
}

impl Sealer {
    pub fn new(key: &[u8; 32]) -> Result<Self, SealError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| SealError::Key)?;
        Ok(Self { cipher, nonce: 0 })
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        if self.nonce == u64::MAX {
            return Err(SealError::NonceExhausted);
        }
        let nonce = nonce_bytes(self.nonce);
        let out = self
            .cipher
            .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SealError::Encrypt)?;
        self.nonce += 1;
        Ok(out)
    }
}

/// Inbound half: opens frames in the order they were sealed.
pub struct Opener {
    cipher: ChaCha20Poly1305,
    nonce: u64,
}

impl Opener {
    pub fn new(key: &[u8; 32]) -> Result<Self, SealError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| SealError::Key)?;
        Ok(Self { cipher, nonce: 0 })
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, SealError> {
        if self.nonce == u64::MAX {
            return Err(SealError::NonceExhausted);
        }
        let nonce = nonce_bytes(self.nonce);
        let out = self
            .cipher
            .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| SealError::Decrypt)?;
        self.nonce += 1;
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SealError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("nonce space exhausted")]
    NonceExhausted,
}
