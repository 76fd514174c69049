//! ChaCha20-Poly1305 AEAD and X25519 public-key derivation.
//!
//! The transport pre-shares a 32-byte symmetric key out of band; that same
//! key is reinterpreted as an X25519 scalar purely so a public key can be
//! advertised in the Handshake frame. The advertised key is never mixed
//! into the session's AEAD key (see DESIGN.md).
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Derives the 12-byte AEAD nonce for a given packet sequence number:
/// little-endian sequence followed by eight zero bytes.
pub fn derive_nonce(sequence: u32) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

/// The symmetric AEAD bound to one session's pre-shared key.
pub struct Aead256 {
    cipher: ChaCha20Poly1305,
}

impl Aead256 {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypts `plaintext` in place, returning ciphertext ‖ 16-byte tag.
    pub fn seal(&self, sequence: u32, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = derive_nonce(sequence);
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::CryptoFailure)
    }

    /// Decrypts `ciphertext` (which must include the trailing tag),
    /// returning the plaintext.
    pub fn open(&self, sequence: u32, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = derive_nonce(sequence);
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| Error::CryptoFailure)
    }
}

/// Reinterprets a pre-shared 32-byte key as an X25519 scalar and derives
/// the corresponding public key for advertisement in the Handshake frame.
pub fn derive_public_key(key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*key);
    let public = PublicKey::from(&secret);
    *public.as_bytes()
}
