//! Credential blob encryption.
//!
//! Every blob that leaves the process is `IV (16 random bytes) || ciphertext`,
//! AES-256-CBC with PKCS#7 padding over the raw file bytes. Each call draws a
//! fresh IV, so identical plaintexts never produce identical blobs.
//!
//! Remote backups only decrypt with the key they were written with. There is
//! no re-encryption path: losing or rotating the key makes every remotely
//! backed-up session for that key unrecoverable.

use crate::error::{GatewayError, Result};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::warn;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// Symmetric cipher for session blobs.
pub struct SessionCipher {
    key: [u8; KEY_LEN],
    ephemeral: bool,
}

impl SessionCipher {
    /// Create a cipher from raw key bytes.
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key,
            ephemeral: false,
        }
    }

    /// Create a cipher from the configured key, or a random process-lifetime
    /// key when none is configured.
    pub fn from_config(configured: Option<&str>) -> Result<Self> {
        match configured {
            Some(encoded) => Ok(Self::new(Self::parse_key(encoded)?)),
            None => {
                warn!(
                    "No session encryption key configured: using a random key for this process only. \
                     Remote backups written now cannot be restored after a restart."
                );
                Ok(Self {
                    key: rand::random(),
                    ephemeral: true,
                })
            }
        }
    }

    /// Parse a 32-byte key given as 64 hex characters or base64.
    pub fn parse_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
        let encoded = encoded.trim();
        let bytes = match hex::decode(encoded) {
            Ok(bytes) if bytes.len() == KEY_LEN => bytes,
            _ => BASE64.decode(encoded).map_err(|e| {
                GatewayError::Config(format!("Encryption key is neither hex nor base64: {}", e))
            })?,
        };

        bytes.try_into().map_err(|bytes: Vec<u8>| {
            GatewayError::Config(format!(
                "Encryption key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })
    }

    /// True when the key was generated for this process only.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Encrypt `plaintext` into `IV || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let iv: [u8; IV_LEN] = rand::random();
        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &iv)
            .map_err(|e| GatewayError::Crypto(format!("Invalid key or IV length: {}", e)))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt an `IV || ciphertext` blob.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < IV_LEN {
            return Err(GatewayError::Crypto(format!(
                "Blob too short: {} bytes, need at least {}",
                blob.len(),
                IV_LEN
            )));
        }
        let (iv, ciphertext) = blob.split_at(IV_LEN);
        let cipher = Aes256CbcDec::new_from_slices(&self.key, iv)
            .map_err(|e| GatewayError::Crypto(format!("Invalid key or IV length: {}", e)))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| GatewayError::Crypto("Decryption failed: wrong key or corrupt blob".to_string()))
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("ephemeral", &self.ephemeral)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> SessionCipher {
        SessionCipher::new([0x42; KEY_LEN])
    }

    #[test]
    fn test_roundtrip() {
        let cipher = test_cipher();
        let payload = br#"{"noiseKey":"abc","registered":true}"#;

        let blob = cipher.encrypt(payload).unwrap();
        assert_eq!(cipher.decrypt(&blob).unwrap(), payload);
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let cipher = test_cipher();
        let blob = cipher.encrypt(&[]).unwrap();

        // IV plus one full padding block
        assert_eq!(blob.len(), IV_LEN + 16);
        assert!(cipher.decrypt(&blob).unwrap().is_empty());
    }

    #[test]
    fn test_each_encryption_unique_iv() {
        let cipher = test_cipher();
        let payload = b"same plaintext";

        let first = cipher.encrypt(payload).unwrap();
        let second = cipher.encrypt(payload).unwrap();

        assert_ne!(first[..IV_LEN], second[..IV_LEN]);
        assert_ne!(first, second);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let payload = b"secret credentials";
        let blob = test_cipher().encrypt(payload).unwrap();
        let other = SessionCipher::new([0x7A; KEY_LEN]);
        // A wrong key almost always breaks the padding; it never yields the plaintext
        assert!(
            other
                .decrypt(&blob)
                .map(|plain| plain != payload)
                .unwrap_or(true)
        );
    }

    #[test]
    fn test_decrypt_truncated_ciphertext_fails() {
        let cipher = test_cipher();
        let blob = cipher.encrypt(b"secret credentials").unwrap();
        assert!(cipher.decrypt(&blob[..blob.len() - 3]).is_err());
    }

    #[test]
    fn test_decrypt_short_blob_fails() {
        let err = test_cipher().decrypt(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, GatewayError::Crypto(_)));
    }

    #[test]
    fn test_parse_key_formats() {
        let hex_key = "42".repeat(KEY_LEN);
        assert_eq!(SessionCipher::parse_key(&hex_key).unwrap(), [0x42; KEY_LEN]);

        let b64_key = BASE64.encode([0x7A; KEY_LEN]);
        assert_eq!(SessionCipher::parse_key(&b64_key).unwrap(), [0x7A; KEY_LEN]);

        assert!(SessionCipher::parse_key("short").is_err());
        assert!(SessionCipher::parse_key(&BASE64.encode([1u8; 16])).is_err());
    }

    #[test]
    fn test_parse_hex_key_edge_cases() {
        let upper = "AB".repeat(KEY_LEN);
        assert_eq!(SessionCipher::parse_key(&upper).unwrap(), [0xAB; KEY_LEN]);
        assert_eq!(
            SessionCipher::parse_key(&format!("  {}\n", "0f".repeat(KEY_LEN))).unwrap(),
            [0x0F; KEY_LEN]
        );

        // Right length, not hex, and not a 32-byte base64 key either
        let not_hex = format!("zz{}", "42".repeat(KEY_LEN - 1));
        let err = SessionCipher::parse_key(&not_hex).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));

        // Hex of the wrong length is rejected
        assert!(SessionCipher::parse_key(&"42".repeat(KEY_LEN - 1)).is_err());
    }

    #[test]
    fn test_configured_and_ephemeral_keys() {
        let configured = SessionCipher::from_config(Some(&"11".repeat(KEY_LEN))).unwrap();
        assert!(!configured.is_ephemeral());

        let ephemeral = SessionCipher::from_config(None).unwrap();
        assert!(ephemeral.is_ephemeral());
        let blob = ephemeral.encrypt(b"data").unwrap();
        assert_eq!(ephemeral.decrypt(&blob).unwrap(), b"data");
    }

    #[test]
    fn test_blocks_of_various_lengths() {
        let cipher = test_cipher();
        for len in [1usize, 15, 16, 17, 255, 4096] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let blob = cipher.encrypt(&payload).unwrap();
            assert_eq!((blob.len() - IV_LEN) % 16, 0);
            assert_eq!(cipher.decrypt(&blob).unwrap(), payload);
        }
    }
}
