//! Model weight decryption (enigma)
//!
//! Encrypted weights are copied from the model store into a working
//! directory and decrypted there in place. The per-model data key is kept
//! wrapped in a secret vault; a KMS master key unwraps it.

pub mod cipher;
pub mod kms;
pub mod shape;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use tracing::{debug, info};
use walkdir::WalkDir;

use ome_common::{Error, Result};

use kms::{EncryptionAlgorithm, KeyManagement, KeyMetadata, KmsCrypto, SecretVault};
use shape::{shape_alias, NodeShapeResolver};

/// Files that are never touched
pub const IGNORED_FILES: [&str; 2] = [".DS_Store", ".gitkeep"];

/// Files whose name contains this are stored in plaintext
pub const EXPORT_METADATA_MARKER: &str = ".exports.metadata";

/// Framework name selecting the engine directory layout
pub const TENSORRT_LLM_FRAMEWORK: &str = "tensorrtllm";

/// Model type selecting the engine directory layout
pub const SERVING_MODEL_TYPE: &str = "Serving";

/// Decryption pass settings
#[derive(Args, Clone, Debug)]
pub struct EnigmaConfig {
    /// Model name, for logs
    #[arg(long, env = "OME_AGENT_MODEL_NAME")]
    pub model_name: String,

    /// Model store directory holding the encrypted weights
    #[arg(long, env = "OME_AGENT_LOCAL_PATH")]
    pub local_path: PathBuf,

    /// Working directory the decrypted copy is written to
    #[arg(long, env = "OME_AGENT_TEMP_PATH", default_value = "/tmp/model-storage")]
    pub temp_path: PathBuf,

    /// Serving framework of the model
    #[arg(long, env = "OME_AGENT_MODEL_FRAMEWORK", default_value = "")]
    pub model_framework: String,

    /// Base model type label
    #[arg(long, env = "OME_AGENT_MODEL_TYPE", default_value = SERVING_MODEL_TYPE)]
    pub model_type: String,

    /// TensorRT-LLM version directory
    #[arg(long, env = "OME_AGENT_TENSORRTLLM_VERSION", default_value = "")]
    pub tensorrt_llm_version: String,

    /// Node shape alias; looked up from the node when unset
    #[arg(long, env = "OME_AGENT_NODE_SHAPE_ALIAS")]
    pub node_shape_alias: Option<String>,

    /// GPUs the engine was built for
    #[arg(long, env = "OME_AGENT_NUM_OF_GPU", default_value = "1")]
    pub num_of_gpu: u32,

    /// Only check that the model store is populated
    #[arg(long, env = "OME_AGENT_DISABLE_MODEL_DECRYPTION")]
    pub disable_model_decryption: bool,

    /// Vault holding the wrapped data key
    #[arg(long, env = "OME_AGENT_VAULT_ID", default_value = "")]
    pub vault_id: String,

    /// Name of the wrapped data key secret
    #[arg(long, env = "OME_AGENT_SECRET_NAME", default_value = "")]
    pub secret_name: String,
}

impl EnigmaConfig {
    /// Whether weights live under the engine directory layout
    pub fn uses_engine_layout(&self) -> bool {
        self.model_framework == TENSORRT_LLM_FRAMEWORK && self.model_type == SERVING_MODEL_TYPE
    }

    fn validate(&self) -> Result<()> {
        if self.disable_model_decryption {
            return Ok(());
        }
        if self.vault_id.is_empty() || self.secret_name.is_empty() {
            return Err(Error::validation_for(
                &self.model_name,
                "OME_AGENT_VAULT_ID and OME_AGENT_SECRET_NAME must be set when decryption is enabled",
            ));
        }
        if self.uses_engine_layout() && self.tensorrt_llm_version.is_empty() {
            return Err(Error::validation_for(
                &self.model_name,
                "OME_AGENT_TENSORRTLLM_VERSION must be set for TensorRT-LLM models",
            ));
        }
        Ok(())
    }
}

/// Collaborators of the decryption pass
pub struct EnigmaServices {
    /// Lists master keys
    pub keys: Arc<dyn KeyManagement>,
    /// Unwraps the data key
    pub crypto: Arc<dyn KmsCrypto>,
    /// Holds the wrapped data key
    pub vault: Arc<dyn SecretVault>,
    /// Looks up the node shape when no alias is configured
    pub shapes: Arc<dyn NodeShapeResolver>,
}

/// The decryption pass
pub struct Enigma {
    config: EnigmaConfig,
    services: EnigmaServices,
}

impl Enigma {
    /// Validate settings and wire collaborators
    pub fn new(config: EnigmaConfig, services: EnigmaServices) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, services })
    }

    /// Validate the store, then copy and decrypt it
    pub async fn run(&self) -> Result<()> {
        info!(model = %self.config.model_name, "starting enigma");

        let sub_path = self.model_sub_path().await?;
        let store = self.config.local_path.join(&sub_path);
        validate_model_store(&store).await?;
        info!(model = %self.config.model_name, path = %store.display(), "model store is populated");

        if self.config.disable_model_decryption {
            info!("model decryption is disabled");
            return Ok(());
        }

        let work_dir = self.config.temp_path.join(&sub_path);
        info!(from = %store.display(), to = %work_dir.display(), "copying model weights");
        let (from, to) = (store.clone(), work_dir.clone());
        crate::archive::blocking(move || copy_tree(&from, &to)).await?;

        let data_key = self.data_key().await?;
        let files = crate::archive::blocking(move || decrypt_tree(&work_dir, &data_key)).await?;
        info!(model = %self.config.model_name, files, "model weights decrypted");
        Ok(())
    }

    /// `<version>/<shape alias>/<n>Gpu` for engine layouts, empty otherwise
    pub async fn model_sub_path(&self) -> Result<PathBuf> {
        if !self.config.uses_engine_layout() {
            return Ok(PathBuf::new());
        }
        let alias = match &self.config.node_shape_alias {
            Some(alias) if !alias.is_empty() => alias.clone(),
            _ => {
                let shape = self.services.shapes.instance_shape().await?;
                let alias = shape_alias(&shape);
                info!(%shape, %alias, "resolved node shape");
                alias
            }
        };
        Ok(PathBuf::from(&self.config.tensorrt_llm_version)
            .join(alias)
            .join(format!("{}Gpu", self.config.num_of_gpu)))
    }

    async fn data_key(&self) -> Result<Vec<u8>> {
        let keys = self
            .services
            .keys
            .get_keys(&KeyMetadata::master_key())
            .await?;
        let master = keys.first().ok_or_else(|| {
            Error::storage_permanent("no enabled AES-256 HSM master key found")
        })?;
        info!(key_id = %master.id, "master key found");

        let wrapped = self
            .services
            .vault
            .get_secret(&self.config.secret_name, &self.config.vault_id)
            .await?;
        let plain = self
            .services
            .crypto
            .decrypt(&wrapped, &master.id, EncryptionAlgorithm::Aes256Gcm)
            .await?;
        info!("data key unwrapped");
        cipher::decode_key(&plain)
    }
}

/// Fail unless `dir` exists and has at least one entry
pub async fn validate_model_store(dir: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
        Error::storage_permanent(format!(
            "model directory {} does not exist: {e}",
            dir.display()
        ))
    })?;
    match entries.next_entry().await? {
        Some(_) => Ok(()),
        None => Err(Error::storage_permanent(format!(
            "model directory {} is empty",
            dir.display()
        ))),
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| Error::storage_permanent(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| Error::internal_with_context("enigma", e.to_string()))?;
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

fn is_ignored(name: &str) -> bool {
    IGNORED_FILES.contains(&name)
}

/// Decrypt every eligible file under `dir` in place; stops at the first failure
fn decrypt_tree(dir: &Path, key: &[u8]) -> Result<usize> {
    let mut decrypted = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| Error::storage_permanent(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_ignored(&name) {
            debug!(file = %name, "skipping ignored file");
            continue;
        }
        if name.contains(EXPORT_METADATA_MARKER) {
            debug!(file = %name, "metadata file is plaintext");
            continue;
        }

        let path = entry.path();
        let sealed = std::fs::read(path)?;
        let plain = cipher::open(key, &sealed).map_err(|e| {
            Error::storage_permanent(format!("failed to decrypt {}: {e}", path.display()))
        })?;
        write_world_writable(path, &plain)?;
        debug!(file = %path.display(), "decrypted");
        decrypted += 1;
    }
    Ok(decrypted)
}

fn write_world_writable(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use kms::{KeySummary, MockKeyManagement, MockKmsCrypto, MockSecretVault};
    use shape::MockNodeShapeResolver;

    const DATA_KEY: [u8; cipher::KEY_LEN] = [5u8; cipher::KEY_LEN];

    fn config(root: &Path) -> EnigmaConfig {
        EnigmaConfig {
            model_name: "llama".to_string(),
            local_path: root.join("m/x/y/z"),
            temp_path: root.join("tmp/model-storage"),
            model_framework: String::new(),
            model_type: SERVING_MODEL_TYPE.to_string(),
            tensorrt_llm_version: String::new(),
            node_shape_alias: None,
            num_of_gpu: 1,
            disable_model_decryption: false,
            vault_id: "vault-1".to_string(),
            secret_name: "DEK0".to_string(),
        }
    }

    fn services(shapes: MockNodeShapeResolver) -> EnigmaServices {
        let mut keys = MockKeyManagement::new();
        keys.expect_get_keys()
            .withf(|f| *f == KeyMetadata::master_key())
            .returning(|_| {
                Ok(vec![KeySummary {
                    id: "key-1".to_string(),
                    algorithm: "AES".to_string(),
                    length: 32,
                    protection_mode: "HSM".to_string(),
                    lifecycle_state: "ENABLED".to_string(),
                }])
            });
        let mut vault = MockSecretVault::new();
        vault
            .expect_get_secret()
            .withf(|name, vault| name == "DEK0" && vault == "vault-1")
            .returning(|_, _| Ok("wrapped-dek".to_string()));
        let mut crypto = MockKmsCrypto::new();
        crypto
            .expect_decrypt()
            .withf(|c, k, a| c == "wrapped-dek" && k == "key-1" && *a == EncryptionAlgorithm::Aes256Gcm)
            .returning(|_, _, _| Ok(STANDARD.encode(DATA_KEY)));
        EnigmaServices {
            keys: Arc::new(keys),
            crypto: Arc::new(crypto),
            vault: Arc::new(vault),
            shapes: Arc::new(shapes),
        }
    }

    fn put(path: &Path, data: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    /// Story: every encrypted file is decrypted; metadata and ignored files stay as they are
    #[tokio::test]
    async fn story_decryption_pass() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let store = config.local_path.clone();
        put(&store.join("model.safetensors"), &cipher::seal(&DATA_KEY, b"tensor").unwrap());
        put(&store.join("tok/tokenizer.json"), &cipher::seal(&DATA_KEY, b"{}").unwrap());
        put(&store.join("weights.exports.metadata"), b"plain metadata");
        put(&store.join(".gitkeep"), b"");

        Enigma::new(config.clone(), services(MockNodeShapeResolver::new()))
            .unwrap()
            .run()
            .await
            .unwrap();

        let work = &config.temp_path;
        assert_eq!(std::fs::read(work.join("model.safetensors")).unwrap(), b"tensor");
        assert_eq!(std::fs::read(work.join("tok/tokenizer.json")).unwrap(), b"{}");
        assert_eq!(
            std::fs::read(work.join("weights.exports.metadata")).unwrap(),
            b"plain metadata"
        );
        assert!(work.join(".gitkeep").exists());
        // the store itself is left encrypted
        assert_ne!(std::fs::read(store.join("model.safetensors")).unwrap(), b"tensor");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(work.join("model.safetensors"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o666);
        }
    }

    #[tokio::test]
    async fn test_empty_store_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        std::fs::create_dir_all(&config.local_path).unwrap();

        let mut keys = MockKeyManagement::new();
        keys.expect_get_keys().never();
        let services = EnigmaServices {
            keys: Arc::new(keys),
            crypto: Arc::new(MockKmsCrypto::new()),
            vault: Arc::new(MockSecretVault::new()),
            shapes: Arc::new(MockNodeShapeResolver::new()),
        };
        let err = Enigma::new(config, services).unwrap().run().await.unwrap_err();
        assert!(err.to_string().contains("is empty"));
    }

    #[tokio::test]
    async fn test_missing_store_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let err = validate_model_store(&root.path().join("absent")).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_corrupt_file_halts_pass() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        put(&config.local_path.join("a.bin"), b"not encrypted at all, definitely");

        let err = Enigma::new(config, services(MockNodeShapeResolver::new()))
            .unwrap()
            .run()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to decrypt"));
    }

    #[tokio::test]
    async fn test_disabled_decryption_only_validates() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config(root.path());
        config.disable_model_decryption = true;
        config.vault_id.clear();
        put(&config.local_path.join("a.bin"), b"x");

        let services = EnigmaServices {
            keys: Arc::new(MockKeyManagement::new()),
            crypto: Arc::new(MockKmsCrypto::new()),
            vault: Arc::new(MockSecretVault::new()),
            shapes: Arc::new(MockNodeShapeResolver::new()),
        };
        Enigma::new(config.clone(), services).unwrap().run().await.unwrap();
        assert!(!config.temp_path.exists());
    }

    /// Story: TensorRT-LLM engines resolve the node shape when no alias is given
    #[tokio::test]
    async fn story_engine_layout_uses_node_shape() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config(root.path());
        config.model_framework = TENSORRT_LLM_FRAMEWORK.to_string();
        config.tensorrt_llm_version = "0.11.0".to_string();
        config.num_of_gpu = 8;
        let sub = Path::new("0.11.0/H100/8Gpu");
        put(
            &config.local_path.join(sub).join("rank0.engine"),
            &cipher::seal(&DATA_KEY, b"engine").unwrap(),
        );

        let mut shapes = MockNodeShapeResolver::new();
        shapes
            .expect_instance_shape()
            .times(1)
            .returning(|| Ok("BM.GPU.H100.8".to_string()));

        Enigma::new(config.clone(), services(shapes))
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(config.temp_path.join(sub).join("rank0.engine")).unwrap(),
            b"engine"
        );
    }

    #[tokio::test]
    async fn test_configured_alias_skips_lookup() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config(root.path());
        config.model_framework = TENSORRT_LLM_FRAMEWORK.to_string();
        config.tensorrt_llm_version = "0.11.0".to_string();
        config.node_shape_alias = Some("A100".to_string());

        let mut shapes = MockNodeShapeResolver::new();
        shapes.expect_instance_shape().never();
        let enigma = Enigma::new(config, services(shapes)).unwrap();
        assert_eq!(
            enigma.model_sub_path().await.unwrap(),
            PathBuf::from("0.11.0/A100/1Gpu")
        );
    }

    #[test]
    fn test_config_validation() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config(root.path());
        config.secret_name.clear();
        assert!(config.validate().is_err());
        config.disable_model_decryption = true;
        assert!(config.validate().is_ok());
    }
}
