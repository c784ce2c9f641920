//! Envelope codec: symmetric authenticated encryption of message bodies.
//!
//! Envelopes are `base64(nonce || ciphertext)` so they stay printable when
//! stored verbatim by the backup consumer. The AES-256-GCM key is the SHA-256
//! digest of the process-wide shared passphrase. GCM authentication means a
//! wrong key, a truncated body or a flipped bit all fail with
//! [`CodecError::Decryption`] rather than yielding garbage.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("decryption failed: {0}")]
    Decryption(&'static str),
    #[error("encryption failed")]
    Encryption,
}

#[derive(Clone)]
pub struct EnvelopeCodec {
    cipher: Arc<Aes256Gcm>,
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec").finish_non_exhaustive()
    }
}

impl EnvelopeCodec {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key = Sha256::digest(passphrase.as_bytes());
        Self { cipher: Arc::new(Aes256Gcm::new(&key)) }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self.cipher.encrypt(&nonce, plaintext).map_err(|_| CodecError::Encryption)?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed).into_bytes())
    }

    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CodecError> {
        let text = std::str::from_utf8(envelope).map_err(|_| CodecError::Decryption("not utf-8"))?;
        let sealed = STANDARD.decode(text.trim()).map_err(|_| CodecError::Decryption("not base64"))?;
        if sealed.len() <= NONCE_LEN {
            return Err(CodecError::Decryption("envelope too short"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CodecError::Decryption("authentication failed"))
    }
}

/// `encrypt(plaintext, key)`
pub fn encrypt(plaintext: &[u8], key: &str) -> Result<Vec<u8>, CodecError> {
    EnvelopeCodec::from_passphrase(key).encrypt(plaintext)
}

/// `decrypt(ciphertext, key)`
pub fn decrypt(envelope: &[u8], key: &str) -> Result<Vec<u8>, CodecError> {
    EnvelopeCodec::from_passphrase(key).decrypt(envelope)
}
