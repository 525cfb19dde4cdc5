//! Credential codec.
//!
//! All sensitive account fields are stored as AES-256-GCM tokens:
//! base64(nonce || ciphertext), 12-byte nonce, 16-byte tag. One process-wide
//! 32-byte key is loaded from `SOVI_MASTER_KEY` at startup; a missing key is
//! fatal at startup, a failed decrypt fails closed per account.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use thiserror::Error;

/// Key length in bytes (256 bits for AES-256)
pub const KEY_LENGTH: usize = 32;

/// Nonce length in bytes (96 bits for AES-GCM)
const NONCE_LENGTH: usize = 12;

/// Environment variable holding the master key.
pub const MASTER_KEY_ENV: &str = "SOVI_MASTER_KEY";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("{MASTER_KEY_ENV} is not set")]
    KeyMissing,

    #[error("invalid master key: {0}")]
    KeyInvalid(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: invalid key or corrupted token")]
    Decrypt,

    #[error("token is not valid base64")]
    TokenEncoding,

    #[error("token too short to hold a nonce")]
    TokenTruncated,
}

/// Stateless codec around a process-wide symmetric key.
#[derive(Clone)]
pub struct Codec {
    key: [u8; KEY_LENGTH],
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Codec(..)")
    }
}

impl Drop for Codec {
    fn drop(&mut self) {
        // Wipe the key on teardown so it does not linger in freed memory.
        for byte in self.key.iter_mut() {
            *byte = 0;
        }
    }
}

impl Codec {
    pub fn new(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Load the codec from `SOVI_MASTER_KEY`. Absence is a startup error.
    pub fn from_env() -> Result<Self, CryptoError> {
        let raw = std::env::var(MASTER_KEY_ENV).map_err(|_| CryptoError::KeyMissing)?;
        if raw.trim().is_empty() {
            return Err(CryptoError::KeyMissing);
        }
        Ok(Self::new(parse_key(&raw)?))
    }

    /// Encrypt plaintext bytes into a base64 token with a fresh nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(&combined))
    }

    /// Encrypt a UTF-8 string field.
    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Decrypt a token back to plaintext bytes. Fails closed on any auth
    /// mismatch; no partial plaintext is ever returned.
    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>, CryptoError> {
        let combined = BASE64
            .decode(token.trim())
            .map_err(|_| CryptoError::TokenEncoding)?;

        if combined.len() < NONCE_LENGTH {
            return Err(CryptoError::TokenTruncated);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Decrypt a token that is expected to hold UTF-8 text.
    pub fn decrypt_str(&self, token: &str) -> Result<String, CryptoError> {
        let bytes = self.decrypt(token)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::Decrypt)
    }
}

/// Parse a 32-byte key from hex (64 chars) or base64.
fn parse_key(raw: &str) -> Result<[u8; KEY_LENGTH], CryptoError> {
    let trimmed = raw.trim();

    if trimmed.len() == KEY_LENGTH * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        let bytes = hex::decode(trimmed).map_err(|e| CryptoError::KeyInvalid(e.to_string()))?;
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        return Ok(key);
    }

    let bytes = BASE64
        .decode(trimmed)
        .map_err(|_| CryptoError::KeyInvalid("neither valid hex nor base64".into()))?;

    if bytes.len() != KEY_LENGTH {
        return Err(CryptoError::KeyInvalid(format!(
            "key must be {} bytes, got {}",
            KEY_LENGTH,
            bytes.len()
        )));
    }

    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_codec() -> Codec {
        let mut key = [0u8; KEY_LENGTH];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        Codec::new(key)
    }

    #[test]
    fn round_trip_is_identity() {
        let codec = test_codec();
        for plaintext in [
            &b""[..],
            b"Hunter2!",
            b"a",
            "Hello, \u{4e16}\u{754c}! \u{1f389}".as_bytes(),
            &[0u8; 1024][..],
        ] {
            let token = codec.encrypt(plaintext).unwrap();
            assert_eq!(codec.decrypt(&token).unwrap(), plaintext);
        }
    }

    #[test]
    fn ciphertext_overhead_is_nonce_plus_tag() {
        let codec = test_codec();
        for len in [0usize, 1, 7, 64, 999] {
            let plaintext = vec![0x42u8; len];
            let token = codec.encrypt(&plaintext).unwrap();
            let raw = BASE64.decode(&token).unwrap();
            // 12-byte nonce + 16-byte tag
            assert_eq!(raw.len(), len + 28);
        }
    }

    #[test]
    fn tampering_fails_closed() {
        let codec = test_codec();
        let token = codec.encrypt_str("Hunter2!").unwrap();
        let mut raw = BASE64.decode(&token).unwrap();
        for i in 0..raw.len() {
            raw[i] ^= 0x01;
            let tampered = BASE64.encode(&raw);
            assert!(codec.decrypt(&tampered).is_err(), "byte {} accepted", i);
            raw[i] ^= 0x01;
        }
    }

    #[test]
    fn distinct_nonces_per_call() {
        let codec = test_codec();
        let a = codec.encrypt_str("same-data").unwrap();
        let b = codec.encrypt_str("same-data").unwrap();
        assert_ne!(a, b);
        assert_eq!(codec.decrypt_str(&a).unwrap(), "same-data");
        assert_eq!(codec.decrypt_str(&b).unwrap(), "same-data");
    }

    #[test]
    fn wrong_key_fails() {
        let codec = test_codec();
        let mut other_key = [0u8; KEY_LENGTH];
        other_key[0] = 0xff;
        let other = Codec::new(other_key);

        let token = codec.encrypt_str("secret").unwrap();
        assert!(other.decrypt(&token).is_err());
    }

    #[test]
    fn parse_key_hex_and_base64() {
        let hex_key = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
        let key = parse_key(hex_key).unwrap();
        for (i, byte) in key.iter().enumerate() {
            assert_eq!(*byte, i as u8);
        }

        let b64_key = BASE64.encode(key);
        assert_eq!(parse_key(&b64_key).unwrap(), key);
    }

    #[test]
    fn parse_key_rejects_garbage() {
        assert!(parse_key("abc").is_err());
        assert!(parse_key(&"z".repeat(64)).is_err());
    }

    #[test]
    fn truncated_token_rejected() {
        let codec = test_codec();
        assert!(matches!(
            codec.decrypt(&BASE64.encode([0u8; 4])),
            Err(CryptoError::TokenTruncated)
        ));
        assert!(matches!(
            codec.decrypt("not-base64!!!"),
            Err(CryptoError::TokenEncoding)
        ));
    }
}
