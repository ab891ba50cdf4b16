//! AES-256-GCM envelope codec for credential tokens.
//!
//! Each token is sealed separately under a fresh random nonce. The result is a
//! self-contained envelope that fits in one text column:
//!
//! ```text
//! base64(nonce) . base64(tag) . base64(ciphertext)
//! ```
//!
//! The master key must be 32 bytes (256 bits) and is provisioned externally.

use crate::error::{Result, VaultError};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

const ENVELOPE_SEPARATOR: char = '.';

/// Validates that the master key is exactly 32 bytes when base64 decoded.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64.decode(key_base64.trim()).map_err(|e| {
        VaultError::Configuration(format!("Failed to decode base64 encryption key: {}", e))
    })?;

    if key_bytes.len() != KEY_SIZE {
        return Err(VaultError::Configuration(format!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        )));
    }

    Ok(key_bytes)
}

/// Authenticated encryption of secret strings under the provisioned key.
#[derive(Clone)]
pub struct Codec {
    cipher: Aes256Gcm,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Codec { key: <redacted> }")
    }
}

impl Codec {
    /// Creates a codec from a base64-encoded 32-byte key.
    ///
    /// Fails with `Configuration` for anything else, so a misprovisioned key stops
    /// the process at startup rather than at the first encryption.
    pub fn new(key_base64: &str) -> Result<Self> {
        let key_bytes = validate_key(key_base64)?;
        Self::from_key_bytes(&key_bytes)
    }

    pub fn from_key_bytes(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(VaultError::Configuration(format!(
                "Encryption key must be {} bytes",
                KEY_SIZE
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| VaultError::Configuration(format!("Failed to create cipher: {}", e)))?;

        Ok(Self { cipher })
    }

    /// Seals `plaintext` into an envelope.
    ///
    /// Two calls with the same plaintext never return the same envelope.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::Configuration(format!("Encryption failed: {}", e)))?;

        // aes-gcm appends the tag to the ciphertext
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

        Ok(format!(
            "{}{sep}{}{sep}{}",
            BASE64.encode(nonce.as_slice()),
            BASE64.encode(tag),
            BASE64.encode(ciphertext),
            sep = ENVELOPE_SEPARATOR
        ))
    }

    /// Opens an envelope produced by [`Codec::encrypt`].
    ///
    /// Fails with `Decryption` when the envelope is malformed, was sealed under
    /// another key, or any byte of it was altered.
    pub fn decrypt(&self, envelope: &str) -> Result<String> {
        let parts: Vec<&str> = envelope.split(ENVELOPE_SEPARATOR).collect();
        let [nonce_b64, tag_b64, ciphertext_b64] = parts.as_slice() else {
            return Err(VaultError::Decryption(format!(
                "Malformed envelope: expected 3 parts, got {}",
                parts.len()
            )));
        };

        let nonce_bytes = decode_part(nonce_b64, "nonce")?;
        let tag = decode_part(tag_b64, "tag")?;
        let mut sealed = decode_part(ciphertext_b64, "ciphertext")?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(VaultError::Decryption(format!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }
        if tag.len() != TAG_SIZE {
            return Err(VaultError::Decryption(format!(
                "Invalid tag size: expected {}, got {}",
                TAG_SIZE,
                tag.len()
            )));
        }

        sealed.extend_from_slice(&tag);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext_bytes = self.cipher.decrypt(nonce, sealed.as_ref()).map_err(|_| {
            VaultError::Decryption("Authentication failed (wrong key or corrupted data)".to_string())
        })?;

        String::from_utf8(plaintext_bytes)
            .map_err(|_| VaultError::Decryption("Decrypted data is not valid UTF-8".to_string()))
    }
}

fn decode_part(part: &str, name: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(part)
        .map_err(|e| VaultError::Decryption(format!("Failed to decode {}: {}", name, e)))
}
