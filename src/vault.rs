//! # Secret Vault
//!
//! Per-account encrypted key/value store with authenticated encryption
//! (AES-256-GCM) and key rotation. Plaintext never leaves the vault except
//! through [`SecretVault::get`] called under the owning account; what the
//! backing [`SecretStore`] sees is always `nonce || ciphertext || tag`.
//!
//! The account and key are bound into the AEAD associated data, so even a
//! ciphertext copied between store slots fails authentication instead of
//! decrypting under the wrong identity.

use std::sync::Arc;

use aes_gcm::aead::{Aead, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::storage::{SecretRecord, SecretStore, StorageError};

const NONCE_LEN: usize = 12;

/// Errors produced by vault operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A 256-bit AES-GCM key. Debug output never reveals the material.
#[derive(Clone)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a key from a passphrase via SHA-256.
    pub fn derive(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        Self(digest.into())
    }

    /// A fresh random key.
    pub fn random() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self(key.into())
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EncryptionKey").field(&"[REDACTED]").finish()
    }
}

/// Account-scoped encrypted secret store.
pub struct SecretVault {
    store: Arc<dyn SecretStore>,
    key: RwLock<EncryptionKey>,
}

impl SecretVault {
    pub fn new(store: Arc<dyn SecretStore>, key: EncryptionKey) -> Self {
        Self {
            store,
            key: RwLock::new(key),
        }
    }

    /// Encrypt `plaintext` under the current key and persist it.
    pub async fn set(
        &self,
        account_id: &str,
        key: &str,
        plaintext: &str,
    ) -> Result<(), VaultError> {
        validate_ids(account_id, key)?;
        let ciphertext = {
            let current = self.key.read().await;
            encrypt(&current, &aad(account_id, key), plaintext.as_bytes())?
        };

        let now = Utc::now();
        let created_at = match self.store.get(account_id, key).await? {
            Some(existing) => existing.created_at,
            None => now,
        };
        self.store
            .put(SecretRecord {
                account_id: account_id.to_string(),
                key: key.to_string(),
                ciphertext,
                created_at,
                updated_at: now,
            })
            .await?;
        debug!(account = account_id, key, "secret stored");
        Ok(())
    }

    /// Decrypt and return the plaintext for `(account_id, key)`.
    pub async fn get(&self, account_id: &str, key: &str) -> Result<String, VaultError> {
        validate_ids(account_id, key)?;
        let record = self
            .store
            .get(account_id, key)
            .await?
            .ok_or_else(|| VaultError::NotFound(key.to_string()))?;

        let plaintext = {
            let current = self.key.read().await;
            decrypt(&current, &aad(account_id, key), &record.ciphertext)?
        };
        String::from_utf8(plaintext)
            .map_err(|_| VaultError::DecryptionFailed("plaintext is not valid UTF-8".into()))
    }

    /// Remove a secret; absent keys are `NotFound`.
    pub async fn delete(&self, account_id: &str, key: &str) -> Result<(), VaultError> {
        validate_ids(account_id, key)?;
        if !self.store.delete(account_id, key).await? {
            return Err(VaultError::NotFound(key.to_string()));
        }
        Ok(())
    }

    /// Keys stored for an account, sorted.
    pub async fn list(&self, account_id: &str) -> Result<Vec<String>, VaultError> {
        if account_id.is_empty() {
            return Err(VaultError::InvalidInput("empty account id".into()));
        }
        Ok(self.store.list_keys(account_id).await?)
    }

    /// Re-encrypt every stored secret from `old` to `new`, then switch the
    /// vault's current key to `new`.
    ///
    /// Each secret is written back immediately after re-encryption, so an
    /// interruption leaves every secret either fully rotated or untouched.
    /// Returns the number of secrets rotated.
    pub async fn rotate_encryption_key(
        &self,
        old: &EncryptionKey,
        new: EncryptionKey,
    ) -> Result<usize, VaultError> {
        let records = self.store.list_all().await?;
        let mut rotated = 0usize;
        for mut record in records {
            let aad = aad(&record.account_id, &record.key);
            let plaintext = decrypt(old, &aad, &record.ciphertext)?;
            record.ciphertext = encrypt(&new, &aad, &plaintext)?;
            record.updated_at = Utc::now();
            self.store.put(record).await?;
            rotated += 1;
        }
        *self.key.write().await = new;
        info!(rotated, "encryption key rotated");
        Ok(rotated)
    }
}

impl std::fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretVault").finish_non_exhaustive()
    }
}

fn validate_ids(account_id: &str, key: &str) -> Result<(), VaultError> {
    if account_id.is_empty() {
        return Err(VaultError::InvalidInput("empty account id".into()));
    }
    if key.is_empty() {
        return Err(VaultError::InvalidInput("empty secret key".into()));
    }
    Ok(())
}

/// Associated data binding a ciphertext to its account and key.
fn aad(account_id: &str, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(account_id.len() + key.len() + 1);
    out.extend_from_slice(account_id.as_bytes());
    out.push(0x1f);
    out.extend_from_slice(key.as_bytes());
    out
}

fn encrypt(key: &EncryptionKey, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = key
        .cipher()
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| VaultError::Storage(StorageError::Backend("aead seal failure".into())))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn decrypt(key: &EncryptionKey, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, VaultError> {
    if ciphertext.len() <= NONCE_LEN {
        return Err(VaultError::DecryptionFailed("ciphertext too short".into()));
    }
    let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(
            Nonce::from_slice(nonce),
            Payload { msg: sealed, aad },
        )
        .map_err(|_| VaultError::DecryptionFailed("ciphertext failed authentication".into()))
}
