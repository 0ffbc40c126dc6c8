//! Secret-at-rest encryption.
//!
//! Secrets (environment credentials injected into sandboxes) are encrypted
//! with ChaCha20-Poly1305 before they are written to the Store. The key is
//! derived from `RELAY_ENCRYPTION_KEY` via HKDF-SHA256 (so the raw env var
//! need not be exactly 32 bytes), and `RELAY_ENCRYPTION_KEY_VERSION` is
//! stamped onto every row so a future key rotation can distinguish rows
//! that still need re-encrypting under the new key.

use anyhow::{anyhow, Context, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use chrono::Utc;
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::{SecretRow, Storage};

pub struct SecretBox {
    cipher: ChaCha20Poly1305,
    key_version: i64,
    storage: Arc<Storage>,
}

impl SecretBox {
    /// `raw_key` is the material from `RELAY_ENCRYPTION_KEY` (any length —
    /// HKDF expands/contracts it to the 32 bytes ChaCha20-Poly1305 needs).
    pub fn new(storage: Arc<Storage>, raw_key: &[u8], key_version: i64) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(None, raw_key);
        let mut okm = [0u8; 32];
        hk.expand(b"relay-secret-at-rest-v1", &mut okm)
            .map_err(|_| anyhow!("HKDF expand failed"))?;
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&okm)),
            key_version,
            storage,
        })
    }

    pub async fn put(&self, kind: &str, aad: &str, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload { msg: plaintext.as_bytes(), aad: aad.as_bytes() },
            )
            .map_err(|_| anyhow!("AEAD encrypt failed"))?;

        let id = Uuid::new_v4().to_string();
        let row = SecretRow {
            id: id.clone(),
            kind: kind.to_string(),
            ciphertext,
            nonce: nonce_bytes.to_vec(),
            key_version: self.key_version,
            aad: aad.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };
        self.storage.put_secret(&row).await?;
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<String> {
        let row = self
            .storage
            .get_secret(id)
            .await?
            .ok_or_else(|| anyhow!("secret {id} not found"))?;
        if row.key_version != self.key_version {
            return Err(anyhow!(
                "secret {id} was encrypted under key version {}, current version is {}",
                row.key_version,
                self.key_version
            ));
        }
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&row.nonce),
                Payload { msg: row.ciphertext.as_ref(), aad: row.aad.as_bytes() },
            )
            .context("AEAD decrypt failed — wrong key, corrupted row, or mismatched aad")?;
        String::from_utf8(plaintext).context("decrypted secret is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
        let secrets = SecretBox::new(storage, b"test-key-material", 1).unwrap();

        let id = secrets.put("github_pat", "session:abc", "ghp_supersecret").await.unwrap();
        let plaintext = secrets.get(&id).await.unwrap();
        assert_eq!(plaintext, "ghp_supersecret");
    }

    #[tokio::test]
    async fn rejects_mismatched_key_version() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
        let secrets_v1 = SecretBox::new(storage.clone(), b"test-key-material", 1).unwrap();
        let id = secrets_v1.put("github_pat", "session:abc", "value").await.unwrap();

        let secrets_v2 = SecretBox::new(storage, b"test-key-material", 2).unwrap();
        let err = secrets_v2.get(&id).await.unwrap_err();
        assert!(err.to_string().contains("key version"));
    }
}
