//! Key management, KMS crypto and secret vault interfaces
//!
//! The decryption pass talks to these three services only through the traits
//! below. The `Mounted*` implementations read key material and secrets that
//! were projected into the pod as files.

use std::path::PathBuf;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use ome_common::{Error, Result};

use super::cipher;

/// Attributes a master key must have
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    /// Cipher family
    pub algorithm: String,
    /// Key length in bytes
    pub length: u32,
    /// Where the key lives
    pub protection_mode: String,
    /// Only enabled keys can decrypt
    pub lifecycle_state: String,
    /// Whether defined tags are requested with the listing
    #[serde(default)]
    pub enable_defined_tag: bool,
}

impl KeyMetadata {
    /// The fixed filter for model master keys
    pub fn master_key() -> Self {
        Self {
            algorithm: "AES".to_string(),
            length: 32,
            protection_mode: "HSM".to_string(),
            lifecycle_state: "ENABLED".to_string(),
            enable_defined_tag: false,
        }
    }

    /// Whether `key` carries every attribute of this filter
    pub fn matches(&self, key: &KeySummary) -> bool {
        key.algorithm == self.algorithm
            && key.length == self.length
            && key.protection_mode == self.protection_mode
            && key.lifecycle_state == self.lifecycle_state
    }
}

/// One key as listed by the key management service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySummary {
    /// Key id used for crypto calls
    pub id: String,
    /// Cipher family
    pub algorithm: String,
    /// Key length in bytes
    pub length: u32,
    /// HSM or software
    pub protection_mode: String,
    /// e.g. ENABLED
    pub lifecycle_state: String,
}

/// Crypto algorithm of a KMS call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    /// AES-256 in GCM mode
    Aes256Gcm,
}

/// Lists keys
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyManagement: Send + Sync {
    /// Keys matching `filter`, in a stable order
    async fn get_keys(&self, filter: &KeyMetadata) -> Result<Vec<KeySummary>>;
}

/// Decrypts with a key that never leaves the service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KmsCrypto: Send + Sync {
    /// Decrypt base64 `ciphertext` under `key_id`; returns base64 plaintext
    async fn decrypt(
        &self,
        ciphertext: &str,
        key_id: &str,
        algorithm: EncryptionAlgorithm,
    ) -> Result<String>;
}

/// Reads secrets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretVault: Send + Sync {
    /// Content of secret `name` in vault `vault_id`
    async fn get_secret(&self, name: &str, vault_id: &str) -> Result<String>;
}

// =============================================================================
// File-backed implementations
// =============================================================================

/// Key index file inside a [`MountedKeyStore`] directory
pub const KEY_INDEX_FILE: &str = "keys.json";

/// Master keys mounted as `<dir>/keys.json` plus `<dir>/<id>.key` (base64)
#[derive(Clone, Debug)]
pub struct MountedKeyStore {
    dir: PathBuf,
}

impl MountedKeyStore {
    /// Store reading from `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn key_material(&self, key_id: &str) -> Result<Vec<u8>> {
        if key_id.contains('/') || key_id.contains("..") {
            return Err(Error::validation_for("kms", format!("invalid key id {key_id:?}")));
        }
        let path = self.dir.join(format!("{key_id}.key"));
        let encoded = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::storage_permanent(format!("master key {key_id} unavailable: {e}"))
        })?;
        cipher::decode_key(&encoded)
    }
}

#[async_trait]
impl KeyManagement for MountedKeyStore {
    async fn get_keys(&self, filter: &KeyMetadata) -> Result<Vec<KeySummary>> {
        let index = tokio::fs::read(self.dir.join(KEY_INDEX_FILE)).await?;
        let mut keys: Vec<KeySummary> = serde_json::from_slice(&index)?;
        keys.retain(|k| filter.matches(k));
        keys.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(count = keys.len(), "listed master keys");
        Ok(keys)
    }
}

#[async_trait]
impl KmsCrypto for MountedKeyStore {
    async fn decrypt(
        &self,
        ciphertext: &str,
        key_id: &str,
        algorithm: EncryptionAlgorithm,
    ) -> Result<String> {
        let EncryptionAlgorithm::Aes256Gcm = algorithm;
        let master = self.key_material(key_id).await?;
        let sealed = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| Error::storage_permanent(format!("wrapped key is not base64: {e}")))?;
        let plain = cipher::open(&master, &sealed)?;
        Ok(STANDARD.encode(plain))
    }
}

/// Secrets mounted as `<dir>/<vault id>/<secret name>`
#[derive(Clone, Debug)]
pub struct MountedSecretVault {
    dir: PathBuf,
}

impl MountedSecretVault {
    /// Vault reading from `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SecretVault for MountedSecretVault {
    async fn get_secret(&self, name: &str, vault_id: &str) -> Result<String> {
        if [name, vault_id]
            .iter()
            .any(|s| s.is_empty() || s.contains('/') || s.contains(".."))
        {
            return Err(Error::validation_for(
                "vault",
                format!("invalid secret reference {vault_id}/{name}"),
            ));
        }
        let path = self.dir.join(vault_id).join(name);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::storage_permanent(format!("secret {name} in vault {vault_id} unavailable: {e}"))
        })?;
        Ok(content.trim().to_string())
    }
}
