//! Content encryption at rest
//!
//! Memory content is stored as AES-256-GCM ciphertext (random nonce
//! prepended, base64 encoded). The box is stateless after init; the key
//! is derived from the configured passphrase with SHA-256.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{MnemaError, Result};

const NONCE_LEN: usize = 12;

/// Placeholder substituted when a read path cannot decrypt a row
pub const UNREADABLE_CONTENT: &str = "[Encrypted Content]";

/// Symmetric crypto box for memory content
#[derive(Clone)]
pub struct CryptoBox {
    key: [u8; 32],
}

impl std::fmt::Debug for CryptoBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoBox").finish_non_exhaustive()
    }
}

impl CryptoBox {
    /// Derive the content key from a passphrase
    pub fn from_secret(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"mnema-content-v1");
        hasher.update(secret.as_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Encrypt plaintext; returns base64(nonce || ciphertext)
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| MnemaError::Encryption(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| MnemaError::Encryption(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(blob))
    }

    /// Decrypt base64(nonce || ciphertext) back to plaintext
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let blob = BASE64
            .decode(encoded)
            .map_err(|e| MnemaError::Encryption(e.to_string()))?;

        if blob.len() < NONCE_LEN {
            return Err(MnemaError::Encryption("ciphertext too short".to_string()));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| MnemaError::Encryption(e.to_string()))?;

        let nonce = Nonce::from_slice(&blob[..NONCE_LEN]);
        let plaintext = cipher
            .decrypt(nonce, &blob[NONCE_LEN..])
            .map_err(|e| MnemaError::Encryption(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| MnemaError::Encryption(e.to_string()))
    }

    /// Decrypt for a read path: substitute a placeholder instead of
    /// failing the call, logging a warning.
    pub fn decrypt_lossy(&self, encoded: &str) -> String {
        match self.decrypt(encoded) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("content decryption failed: {}", e);
                UNREADABLE_CONTENT.to_string()
            }
        }
    }
}
