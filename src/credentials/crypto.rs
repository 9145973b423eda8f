use crate::error::SyncError;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use std::collections::BTreeMap;

const NONCE_LEN: usize = 12;

/// AES-256-GCM over the JSON-serialized field map. Blob layout is the
/// 12-byte nonce followed by the ciphertext.
pub struct CredentialCipher {
    key: [u8; 32],
}

impl CredentialCipher {
    /// Key material arrives base64-encoded (e.g. from the environment) and
    /// must decode to exactly 32 bytes.
    pub fn from_base64(key_b64: &str) -> Result<Self, SyncError> {
        if key_b64.is_empty() {
            return Err(SyncError::Crypto(
                "encryption key is required (set TRIBUTARY_ENCRYPTION_KEY)".to_string(),
            ));
        }
        let key_bytes = BASE64
            .decode(key_b64)
            .map_err(|e| SyncError::Crypto(format!("encryption key is not valid base64: {e}")))?;
        let key: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| SyncError::Crypto("encryption key must be 32 bytes".to_string()))?;
        Ok(Self { key })
    }

    pub fn encrypt(&self, fields: &BTreeMap<String, String>) -> Result<Vec<u8>, SyncError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| SyncError::Crypto(format!("invalid key length: {e:?}")))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = serde_json::to_vec(fields)?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| SyncError::Crypto(format!("encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<BTreeMap<String, String>, SyncError> {
        if blob.len() <= NONCE_LEN {
            return Err(SyncError::Crypto("ciphertext too short".to_string()));
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| SyncError::Crypto(format!("invalid key length: {e:?}")))?;

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| SyncError::Crypto(format!("decryption failed: {e}")))?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
