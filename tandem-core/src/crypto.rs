// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
#![forbid(unsafe_code)]

//! Envelope encryption of share material at rest.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use rand::RngCore;
use tracing::debug;
use zeroize::Zeroizing;

use crate::encoding::{from_base64, to_base64};
use crate::error::{Result, TandemError};

pub const NONCE_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;

/// Environment variable consulted by [`EnvelopeEncryptor::from_env`] by default.
pub const DEFAULT_MASTER_KEY_ENV: &str = "TANDEM_MASTER_KEY";

/// Seals and opens share bytes for storage.
pub trait KeyEncryptor: Send + Sync {
    fn encrypt_share(&self, share: &[u8]) -> Result<String>;
    fn decrypt_share(&self, token: &str) -> Result<Zeroizing<Vec<u8>>>;
}

/// Base64 only. Offers no confidentiality; development use.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEncryptor;

impl KeyEncryptor for PassthroughEncryptor {
    fn encrypt_share(&self, share: &[u8]) -> Result<String> {
        Ok(to_base64(share))
    }

    fn decrypt_share(&self, token: &str) -> Result<Zeroizing<Vec<u8>>> {
        from_base64(token)
            .map(Zeroizing::new)
            .ok_or(TandemError::DecryptionFailed)
    }
}

/// ChaCha20-Poly1305 envelope: `base64(nonce || tag || ciphertext)`.
pub struct EnvelopeEncryptor {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl EnvelopeEncryptor {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Parses a master key given as hex or base64; surrounding whitespace is ignored.
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        let trimmed = encoded.trim();
        let is_hex = !trimmed.is_empty()
            && trimmed.len() % 2 == 0
            && trimmed.bytes().all(|b| b.is_ascii_hexdigit());
        let decoded = if is_hex {
            hex::decode(trimmed).ok()
        } else {
            from_base64(trimmed)
        }
        .map(Zeroizing::new)
        .ok_or_else(|| TandemError::InvalidKey("master key is neither hex nor base64".into()))?;

        if decoded.len() != KEY_SIZE {
            return Err(TandemError::InvalidKey(format!(
                "master key must be {KEY_SIZE} bytes, got {}",
                decoded.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&decoded);
        let encryptor = Self::new(key);
        zeroize::Zeroize::zeroize(&mut key);
        Ok(encryptor)
    }

    pub fn from_env(var: &str) -> Result<Self> {
        let value = Zeroizing::new(std::env::var(var).map_err(|_| {
            TandemError::Config(format!("{var} must be set to a 32-byte hex or base64 key"))
        })?);
        debug!(var, "loaded master key from environment");
        Self::from_encoded(&value)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.key.as_slice()))
    }
}

impl std::fmt::Debug for EnvelopeEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeEncryptor").finish_non_exhaustive()
    }
}

impl KeyEncryptor for EnvelopeEncryptor {
    fn encrypt_share(&self, share: &[u8]) -> Result<String> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let mut buffer = Zeroizing::new(share.to_vec());
        let tag = self
            .cipher()
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", buffer.as_mut_slice())
            .map_err(|_| TandemError::Encryption("failed to seal share".into()))?;

        let mut envelope = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + buffer.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(tag.as_slice());
        envelope.extend_from_slice(&buffer);
        Ok(to_base64(&envelope))
    }

    fn decrypt_share(&self, token: &str) -> Result<Zeroizing<Vec<u8>>> {
        let envelope = from_base64(token).ok_or(TandemError::DecryptionFailed)?;
        if envelope.len() < NONCE_SIZE + TAG_SIZE {
            return Err(TandemError::DecryptionFailed);
        }
        let (nonce, rest) = envelope.split_at(NONCE_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);

        let mut buffer = Zeroizing::new(ciphertext.to_vec());
        self.cipher()
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                b"",
                buffer.as_mut_slice(),
                Tag::from_slice(tag),
            )
            .map_err(|_| TandemError::DecryptionFailed)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_envelope_roundtrip() {
        let enc = EnvelopeEncryptor::from_encoded(HEX_KEY).unwrap();
        let token = enc.encrypt_share(b"server share").unwrap();
        assert_ne!(token, to_base64(b"server share"));
        assert_eq!(enc.decrypt_share(&token).unwrap().as_slice(), b"server share");
    }

    #[test]
    fn test_envelope_layout() {
        let enc = EnvelopeEncryptor::new([7u8; KEY_SIZE]);
        let token = enc.encrypt_share(&[1, 2, 3]).unwrap();
        let raw = from_base64(&token).unwrap();
        assert_eq!(raw.len(), NONCE_SIZE + TAG_SIZE + 3);
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let enc = EnvelopeEncryptor::new([7u8; KEY_SIZE]);
        let a = enc.encrypt_share(b"same").unwrap();
        let b = enc.encrypt_share(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_tag_fails_closed() {
        let enc = EnvelopeEncryptor::new([9u8; KEY_SIZE]);
        let token = enc.encrypt_share(b"share").unwrap();
        let mut raw = from_base64(&token).unwrap();
        raw[NONCE_SIZE] ^= 0x01;
        assert!(matches!(
            enc.decrypt_share(&to_base64(&raw)),
            Err(TandemError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let token = EnvelopeEncryptor::new([1u8; KEY_SIZE])
            .encrypt_share(b"share")
            .unwrap();
        assert!(EnvelopeEncryptor::new([2u8; KEY_SIZE])
            .decrypt_share(&token)
            .is_err());
    }

    #[test]
    fn test_short_envelope_rejected() {
        let enc = EnvelopeEncryptor::new([1u8; KEY_SIZE]);
        assert!(enc.decrypt_share(&to_base64(&[0u8; 20])).is_err());
        assert!(enc.decrypt_share("%%%").is_err());
    }

    #[test]
    fn test_key_parsing() {
        assert!(EnvelopeEncryptor::from_encoded(&format!("  {HEX_KEY}\n")).is_ok());
        assert!(EnvelopeEncryptor::from_encoded(&to_base64(&[3u8; 32])).is_ok());
        assert!(matches!(
            EnvelopeEncryptor::from_encoded("abcd"),
            Err(TandemError::InvalidKey(_))
        ));
        assert!(EnvelopeEncryptor::from_encoded(&to_base64(&[3u8; 16])).is_err());
    }

    #[test]
    fn test_from_env_missing() {
        assert!(matches!(
            EnvelopeEncryptor::from_env("TANDEM_TEST_KEY_THAT_IS_NOT_SET"),
            Err(TandemError::Config(_))
        ));
    }

    #[test]
    fn test_passthrough() {
        let enc = PassthroughEncryptor;
        let token = enc.encrypt_share(b"dev").unwrap();
        assert_eq!(token, "ZGV2");
        assert_eq!(enc.decrypt_share(&token).unwrap().as_slice(), b"dev");
    }
}
