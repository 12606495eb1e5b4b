use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::CryptoError;
use super::key_manager::KeyManager;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Self-describing ciphertext. All byte fields are standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub iv: String,
    pub ciphertext: String,
    pub tag: String,
    pub key_id: String,
}

/// AES-256-GCM over the [`KeyManager`]'s current key.
#[derive(Clone)]
pub struct Encryptor {
    keys: Arc<KeyManager>,
}

impl Encryptor {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Encrypt under the current key with a fresh random nonce. Rotates
    /// first if the current key has aged out.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope, CryptoError> {
        self.keys.rotate_if_due()?;
        let (key_id, dek) = self.keys.current_key()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&dek[..]));
        let mut sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        // aes-gcm appends the tag to the ciphertext.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(EncryptedEnvelope {
            iv: B64.encode(nonce_bytes),
            ciphertext: B64.encode(&sealed),
            tag: B64.encode(&tag),
            key_id,
        })
    }

    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, CryptoError> {
        let dek = match self.keys.key(&envelope.key_id) {
            Err(CryptoError::UnknownEncryptionKey(_)) => {
                // Another process may have rotated since we loaded the store.
                self.keys.reload()?;
                self.keys.key(&envelope.key_id)?
            }
            other => other?,
        };

        let nonce_bytes = decode_field("iv", &envelope.iv)?;
        let mut sealed = decode_field("ciphertext", &envelope.ciphertext)?;
        let tag = decode_field("tag", &envelope.tag)?;

        if nonce_bytes.len() != NONCE_LEN {
            return Err(CryptoError::MalformedEnvelope("iv must be 12 bytes".to_string()));
        }
        if tag.len() != TAG_LEN {
            return Err(CryptoError::MalformedEnvelope("tag must be 16 bytes".to_string()));
        }
        sealed.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&dek[..]));
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), sealed.as_slice())
            .map_err(|_| {
                tracing::warn!(key_id = %envelope.key_id, "Envelope failed authentication");
                CryptoError::EncryptionAuthenticationFailed
            })
    }

    /// Encrypt a string and serialize the envelope as JSON.
    pub fn encrypt_to_json(&self, plaintext: &str) -> Result<String, CryptoError> {
        let envelope = self.encrypt(plaintext.as_bytes())?;
        serde_json::to_string(&envelope)
            .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))
    }

    pub fn decrypt_from_json(&self, json: &str) -> Result<String, CryptoError> {
        let envelope: EncryptedEnvelope = serde_json::from_str(json)
            .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;
        let plaintext = self.decrypt(&envelope)?;
        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::MalformedEnvelope("plaintext is not UTF-8".to_string()))
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    B64.decode(value)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("{}: {}", name, e)))
}
