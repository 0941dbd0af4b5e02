//! Symmetric session channel: XChaCha20-Poly1305 AEAD.
//!
//! The channel is created once per connection, after the encryption
//! handshake fixes the session key, and has no rekey or fallback path. A
//! decrypt failure means tampering or desync and is always fatal to the
//! connection.

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, Key, XChaCha20Poly1305, XNonce};
use zeroize::Zeroize;

use crate::error::{CmError, Result};

/// Size of the random nonce prefixed to every sealed payload.
pub const NONCE_SIZE: usize = 24;

/// Authenticated encryption over one session key.
pub struct CryptoChannel {
    cipher: XChaCha20Poly1305,
}

impl CryptoChannel {
    /// Open a channel over a 32-byte session key. The caller's key copy is
    /// zeroized.
    pub fn new(mut key: [u8; 32]) -> Self {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();
        Self { cipher }
    }

    /// Generate a fresh random nonce.
    pub fn generate_nonce() -> XNonce {
        XChaCha20Poly1305::generate_nonce(&mut OsRng)
    }

    /// Seal a plaintext payload: `nonce(24) || ciphertext`.
    ///
    /// # Errors
    /// Returns `CmError::EncryptionFailure` if the AEAD rejects the input.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::generate_nonce();
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CmError::EncryptionFailure)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed payload.
    ///
    /// # Errors
    /// Returns `CmError::DecryptionFailure` on truncated input or an
    /// authentication failure. Callers must treat this as fatal.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(CmError::DecryptionFailure);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = XNonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CmError::DecryptionFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let channel = CryptoChannel::new([7u8; 32]);
        let sealed = channel.seal(b"session payload").unwrap();
        assert_eq!(channel.open(&sealed).unwrap(), b"session payload");
    }

    #[test]
    fn nonces_are_unique_per_seal() {
        let channel = CryptoChannel::new([7u8; 32]);
        let a = channel.seal(b"x").unwrap();
        let b = channel.seal(b"x").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let channel = CryptoChannel::new([7u8; 32]);
        let mut sealed = channel.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(matches!(
            channel.open(&sealed),
            Err(CmError::DecryptionFailure)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let a = CryptoChannel::new([1u8; 32]);
        let b = CryptoChannel::new([2u8; 32]);
        let sealed = a.seal(b"payload").unwrap();
        assert!(matches!(b.open(&sealed), Err(CmError::DecryptionFailure)));
    }

    #[test]
    fn truncated_input_fails() {
        let channel = CryptoChannel::new([7u8; 32]);
        assert!(matches!(
            channel.open(&[0u8; NONCE_SIZE - 1]),
            Err(CmError::DecryptionFailure)
        ));
    }
}
