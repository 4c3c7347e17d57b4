//! Authenticated encryption of stream frames.
//!
//! Every frame on the wire is `nonce (12) ‖ ciphertext ‖ tag (16)` under a
//! single ChaCha20-Poly1305 key shared by the relay and the agent. A fresh
//! random nonce is drawn for every call to [`FrameCipher::encrypt`]; the cipher
//! keeps no other state between calls.

use crate::types::{KEY_LEN, MIN_FRAME_LEN, NONCE_LEN};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::Rng;
use thiserror::Error;

/// Errors produced while building a cipher or opening a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// The key material is not 64 hexadecimal characters.
    #[error("invalid key: expected {KEY_LEN} bytes as hex")]
    InvalidKey,
    /// The frame cannot even hold a nonce and a tag.
    #[error("frame too short: need at least {MIN_FRAME_LEN} bytes, got {0}")]
    Truncated(usize),
    /// Tag verification failed (wrong key, nonce or corrupted data).
    #[error("frame authentication failed")]
    Authentication,
    /// The AEAD refused to seal the plaintext.
    #[error("frame encryption failed")]
    Encryption,
}

/// ChaCha20-Poly1305 frame sealer/opener bound to the process-wide key.
#[derive(Clone)]
pub struct FrameCipher {
    aead: ChaCha20Poly1305,
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher").finish_non_exhaustive()
    }
}

impl FrameCipher {
    /// Creates a cipher from raw key bytes.
    #[must_use]
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Creates a cipher from a 64-character hex key (the `TUNNEL_CHACHA_KEY` format).
    ///
    /// # Examples
    ///
    /// ```
    /// use wgt_common::FrameCipher;
    ///
    /// let cipher = FrameCipher::from_hex(&"ab".repeat(32)).unwrap();
    /// let frame = cipher.encrypt(b"ping").unwrap();
    /// assert_eq!(cipher.decrypt(&frame).unwrap(), b"ping");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKey`] if the input is not exactly
    /// [`KEY_LEN`] bytes of hex.
    pub fn from_hex(hex_key: &str) -> Result<Self, CipherError> {
        Ok(Self::new(&parse_hex_key(hex_key)?))
    }

    /// Seals `plaintext` under a fresh random nonce.
    ///
    /// The output is `nonce ‖ ciphertext ‖ tag`, exactly
    /// `plaintext.len() + 28` bytes long.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Encryption`] if the AEAD rejects the input
    /// (only possible for plaintexts beyond the ChaCha20 block counter limit).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill(&mut nonce);

        let sealed = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Encryption)?;

        let mut frame = Vec::with_capacity(NONCE_LEN + sealed.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Verifies and opens a frame produced by [`FrameCipher::encrypt`].
    ///
    /// No plaintext is released unless the tag verifies.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Truncated`] for frames shorter than nonce + tag
    /// and [`CipherError::Authentication`] on any tag mismatch.
    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, CipherError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(CipherError::Truncated(frame.len()));
        }
        let (nonce, sealed) = frame.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Authentication)
    }
}

/// Decodes a hex key into its fixed-size byte form.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKey`] on bad hex or wrong length.
pub fn parse_hex_key(hex_key: &str) -> Result<[u8; KEY_LEN], CipherError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|_| CipherError::InvalidKey)?;
    bytes.try_into().map_err(|_| CipherError::InvalidKey)
}
