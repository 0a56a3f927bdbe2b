//! Model metadata extraction
//!
//! Runs as a one-shot Job with a model volume mounted read-only. The
//! model's config file is parsed and the findings are published as a flat
//! ConfigMap named `<model>-metadata`, which the BaseModel controller reads
//! back into the model spec.

pub mod hf_config;
pub mod safetensors;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Args;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use ome_common::{Error, Result};

use hf_config::{find_config_file, HfModelConfig, CONFIG_FILES};

/// Field manager for the metadata ConfigMap
pub const FIELD_MANAGER: &str = "ome-agent";
/// Label naming the model a metadata ConfigMap describes
pub const MODEL_NAME_LABEL: &str = "ome.io/basemodel-name";
/// Label naming the model's namespace; absent for cluster-scoped models
pub const MODEL_NAMESPACE_LABEL: &str = "ome.io/basemodel-namespace";

/// Name of the ConfigMap carrying `model`'s metadata
pub fn metadata_config_map_name(model: &str) -> String {
    format!("{model}-metadata")
}

/// Extraction job settings
#[derive(Args, Clone, Debug)]
pub struct MetadataConfig {
    /// Mounted model directory
    #[arg(long, env = "OME_AGENT_MODEL_PATH", default_value = "/mnt/models")]
    pub model_path: PathBuf,

    /// BaseModel or ClusterBaseModel name
    #[arg(long = "basemodel-name", env = "OME_AGENT_BASEMODEL_NAME")]
    pub base_model_name: String,

    /// Namespace of a BaseModel; empty for a ClusterBaseModel
    #[arg(long = "basemodel-namespace", env = "OME_AGENT_BASEMODEL_NAMESPACE", default_value = "")]
    pub base_model_namespace: String,

    /// Namespace to write the ConfigMap to; defaults to the pod's own
    #[arg(long, env = "POD_NAMESPACE")]
    pub output_namespace: Option<String>,
}

/// Destination of discovered metadata
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetadataSink: Send + Sync {
    /// Create or replace the ConfigMap `name` with `data` and `labels`
    async fn publish(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        data: BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Writes the ConfigMap with server-side apply
pub struct KubeMetadataSink {
    client: Client,
    namespace: String,
}

impl KubeMetadataSink {
    /// Write into `namespace`, or the client's default namespace
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        let namespace = namespace
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| client.default_namespace().to_string());
        Self { client, namespace }
    }
}

#[async_trait]
impl MetadataSink for KubeMetadataSink {
    async fn publish(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": self.namespace, "labels": labels },
            "data": data,
        });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&manifest),
        )
        .await?;
        info!(configmap = %name, namespace = %self.namespace, "metadata ConfigMap applied");
        Ok(())
    }
}

/// The extraction job
pub struct MetadataAgent {
    config: MetadataConfig,
    sink: Arc<dyn MetadataSink>,
}

impl MetadataAgent {
    #[allow(missing_docs)]
    pub fn new(config: MetadataConfig, sink: Arc<dyn MetadataSink>) -> Result<Self> {
        if config.base_model_name.is_empty() {
            return Err(Error::validation_for(
                "model-metadata",
                "--basemodel-name is required",
            ));
        }
        Ok(Self { config, sink })
    }

    /// Parse the config and publish the flat metadata
    pub async fn run(&self) -> Result<BTreeMap<String, String>> {
        let model_dir = self.config.model_path.clone();
        info!(path = %model_dir.display(), model = %self.config.base_model_name, "extracting model metadata");

        let discovered = crate::archive::blocking(move || {
            let path = find_config_file(&model_dir).ok_or_else(|| {
                Error::storage_permanent(format!(
                    "no model config file found in {} (tried: {})",
                    model_dir.display(),
                    CONFIG_FILES.join(", ")
                ))
            })?;
            info!(config = %path.display(), "found model config");
            Ok(HfModelConfig::load(&path)?.discover(&model_dir))
        })
        .await?;

        let data = discovered.to_flat_map();
        let mut labels = BTreeMap::new();
        labels.insert(
            MODEL_NAME_LABEL.to_string(),
            self.config.base_model_name.clone(),
        );
        if !self.config.base_model_namespace.is_empty() {
            labels.insert(
                MODEL_NAMESPACE_LABEL.to_string(),
                self.config.base_model_namespace.clone(),
            );
        }

        self.sink
            .publish(
                &metadata_config_map_name(&self.config.base_model_name),
                labels,
                data.clone(),
            )
            .await?;
        info!(model = %self.config.base_model_name, fields = data.len(), "model metadata published");
        Ok(data)
    }
}
