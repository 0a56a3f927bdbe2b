//! BaseModel and ClusterBaseModel CRDs
//!
//! Both kinds share [`BaseModelSpec`] and [`BaseModelStatus`]; the cluster
//! kind wraps the spec so kube-derive can generate a second CRD. Code that
//! works on either kind goes through [`ModelResource`].

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::types::{
    preserve_unknown_fields, Condition, LifeCycleState, ModelFormat, ModelFrameworkSpec,
    StorageSpec,
};
use crate::model_entry::{ModelConfig, ModelKey};

/// Finalizer guarding BaseModel deletion until every node dropped the model
pub const BASE_MODEL_FINALIZER: &str = "basemodels.ome.io/finalizer";

/// Finalizer guarding ClusterBaseModel deletion
pub const CLUSTER_BASE_MODEL_FINALIZER: &str = "clusterbasemodels.ome.io/finalizer";

/// Desired state of a base model
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ome.io",
    version = "v1beta1",
    kind = "BaseModel",
    plural = "basemodels",
    shortname = "bm",
    namespaced,
    status = "BaseModelStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.modelType"}"#,
    printcolumn = r#"{"name":"Size","type":"string","jsonPath":".spec.modelParameterSize"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BaseModelSpec {
    /// Serialization format of the weights
    #[serde(default)]
    pub model_format: ModelFormat,

    /// Model family (e.g. "llama"); discovered when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,

    /// Target framework; discovered when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_framework: Option<ModelFrameworkSpec>,

    /// Architecture class (e.g. "LlamaForCausalLM"); discovered when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_architecture: Option<String>,

    /// Quantization scheme (e.g. "fp8")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,

    /// Human-readable parameter count (e.g. "7B")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_parameter_size: Option<String>,

    /// What the model can do (e.g. TEXT_GENERATION)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub model_capabilities: Vec<String>,

    /// API surfaces the model serves
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_capabilities: Vec<String>,

    /// Raw model configuration (e.g. config.json)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub model_configuration: Option<serde_json::Value>,

    /// Where the weights live
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Model version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Model vendor (e.g. "meta", "cohere")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,

    /// Whether the model is disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,

    /// Compartment the model belongs to
    #[serde(
        default,
        rename = "compartmentID",
        skip_serializing_if = "Option::is_none"
    )]
    pub compartment_id: Option<String>,

    /// Serving modes (e.g. On-demand, Dedicated)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub serving_mode: Vec<String>,

    /// Maximum context length; discovered when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i32>,

    /// Free-form metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_metadata: BTreeMap<String, String>,
}

impl BaseModelSpec {
    /// Storage URI, if any
    pub fn storage_uri(&self) -> Option<&str> {
        self.storage.as_ref()?.storage_uri.as_deref()
    }

    /// Fill spec fields from discovered metadata, never overwriting a set field.
    ///
    /// Returns whether any field was filled.
    pub fn apply_discovered(&mut self, config: &ModelConfig) -> bool {
        let mut changed = false;

        changed |= fill(&mut self.model_type, config.model_type.as_ref());
        changed |= fill(
            &mut self.model_architecture,
            config.model_architecture.as_ref(),
        );
        changed |= fill(
            &mut self.model_parameter_size,
            config.model_parameter_size.as_ref(),
        );

        if self.model_capabilities.is_empty() && !config.model_capabilities.is_empty() {
            self.model_capabilities = config.model_capabilities.clone();
            changed = true;
        }
        if self.api_capabilities.is_empty() && !config.api_capabilities.is_empty() {
            self.api_capabilities = config.api_capabilities.clone();
            changed = true;
        }

        match self.model_framework.as_mut() {
            None => {
                if let Some(name) = config.framework_name() {
                    self.model_framework = Some(ModelFrameworkSpec {
                        name: name.to_string(),
                        version: config.framework_version().map(str::to_string),
                    });
                    changed = true;
                }
            }
            Some(fw) => {
                if fw.version.is_none() {
                    if let Some(v) = config.framework_version() {
                        fw.version = Some(v.to_string());
                        changed = true;
                    }
                }
            }
        }

        if self.model_format.name.is_empty() {
            if let Some(name) = config.format_name() {
                self.model_format.name = name.to_string();
                changed = true;
            }
        }
        if self.model_format.version.is_none() && !self.model_format.name.is_empty() {
            if let Some(v) = config.format_version() {
                self.model_format.version = Some(v.to_string());
                changed = true;
            }
        }

        if self.max_tokens.is_none() {
            if let Some(tokens) = config.max_tokens.filter(|t| *t > 0) {
                self.max_tokens = Some(tokens);
                changed = true;
            }
        }

        changed
    }

    /// Whether every field the metadata extractor can discover is already set
    pub fn has_discovered_metadata(&self) -> bool {
        self.model_type.is_some()
            && self.model_architecture.is_some()
            && self.model_parameter_size.is_some()
            && self.model_framework.is_some()
            && !self.model_format.name.is_empty()
    }
}

fn fill(field: &mut Option<String>, value: Option<&String>) -> bool {
    match (field.as_ref(), value) {
        (None, Some(v)) if !v.is_empty() => {
            *field = Some(v.clone());
            true
        }
        _ => false,
    }
}

/// Result of the last external-registry check
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageValidationStatus {
    /// When the registry was last consulted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    /// Whether the model is believed to be accessible
    #[serde(default)]
    pub valid: bool,
    /// Error, warning or success message of the last check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Observed state of a base model
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BaseModelStatus {
    /// Overall placement state
    #[serde(default)]
    pub state: LifeCycleState,

    /// Free-form lifecycle detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<String>,

    /// Nodes reporting the model Ready
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes_ready: Vec<String>,

    /// Nodes reporting the model Failed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes_failed: Vec<String>,

    /// External-registry validation result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<StorageValidationStatus>,

    /// Conditions (PVCValidated, MetadataExtracted, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Desired state of a cluster-scoped base model
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ome.io",
    version = "v1beta1",
    kind = "ClusterBaseModel",
    plural = "clusterbasemodels",
    shortname = "cbm",
    status = "BaseModelStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.modelType"}"#,
    printcolumn = r#"{"name":"Size","type":"string","jsonPath":".spec.modelParameterSize"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ClusterBaseModelSpec {
    /// Same fields as a BaseModel
    #[serde(flatten)]
    pub model: BaseModelSpec,
}

impl Deref for ClusterBaseModelSpec {
    type Target = BaseModelSpec;

    fn deref(&self) -> &BaseModelSpec {
        &self.model
    }
}

impl DerefMut for ClusterBaseModelSpec {
    fn deref_mut(&mut self) -> &mut BaseModelSpec {
        &mut self.model
    }
}

/// Shared view over [`BaseModel`] and [`ClusterBaseModel`]
pub trait ModelResource:
    Resource<DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Kind name used in logs and events
    const KIND: &'static str;

    /// Finalizer owned by the controller of this kind
    const FINALIZER: &'static str;

    /// Label put on dependent objects pointing back at the model
    const OWNER_LABEL: &'static str;

    /// The model spec
    fn model_spec(&self) -> &BaseModelSpec;

    /// Mutable model spec
    fn model_spec_mut(&mut self) -> &mut BaseModelSpec;

    /// The model status, if set
    fn model_status(&self) -> Option<&BaseModelStatus>;

    /// Whether the kind is cluster-scoped
    fn is_cluster_scoped() -> bool;

    /// Identity of this model in per-node ConfigMap keys
    fn model_key(&self) -> ModelKey {
        let ns = if Self::is_cluster_scoped() {
            None
        } else {
            self.namespace()
        };
        ModelKey::new(ns.as_deref(), &self.name_any())
    }
}

impl ModelResource for BaseModel {
    const KIND: &'static str = "BaseModel";
    const FINALIZER: &'static str = BASE_MODEL_FINALIZER;
    const OWNER_LABEL: &'static str = "ome.io/basemodel";

    fn model_spec(&self) -> &BaseModelSpec {
        &self.spec
    }

    fn model_spec_mut(&mut self) -> &mut BaseModelSpec {
        &mut self.spec
    }

    fn model_status(&self) -> Option<&BaseModelStatus> {
        self.status.as_ref()
    }

    fn is_cluster_scoped() -> bool {
        false
    }
}

impl ModelResource for ClusterBaseModel {
    const KIND: &'static str = "ClusterBaseModel";
    const FINALIZER: &'static str = CLUSTER_BASE_MODEL_FINALIZER;
    const OWNER_LABEL: &'static str = "ome.io/clusterbasemodel";

    fn model_spec(&self) -> &BaseModelSpec {
        &self.spec.model
    }

    fn model_spec_mut(&mut self) -> &mut BaseModelSpec {
        &mut self.spec.model
    }

    fn model_status(&self) -> Option<&BaseModelStatus> {
        self.status.as_ref()
    }

    fn is_cluster_scoped() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn discovered() -> ModelConfig {
        let mut framework = BTreeMap::new();
        framework.insert("name".to_string(), "transformers".to_string());
        framework.insert("version".to_string(), "4.44.0".to_string());
        let mut format = BTreeMap::new();
        format.insert("name".to_string(), "safetensors".to_string());
        ModelConfig {
            model_type: Some("llama".to_string()),
            model_architecture: Some("LlamaForCausalLM".to_string()),
            model_framework: framework,
            model_format: format,
            model_parameter_size: Some("8.03B".to_string()),
            max_tokens: Some(131072),
            model_capabilities: vec!["TEXT_GENERATION".to_string()],
            api_capabilities: vec![],
        }
    }

    /// Story: discovered metadata fills gaps but never overwrites user input
    #[test]
    fn story_backfill_is_first_writer_wins() {
        let mut spec = BaseModelSpec {
            model_type: Some("custom".to_string()),
            ..Default::default()
        };

        assert!(spec.apply_discovered(&discovered()));
        assert_eq!(spec.model_type.as_deref(), Some("custom"));
        assert_eq!(spec.model_architecture.as_deref(), Some("LlamaForCausalLM"));
        assert_eq!(spec.model_format.name, "safetensors");
        assert_eq!(spec.max_tokens, Some(131072));
        assert_eq!(
            spec.model_framework.as_ref().unwrap().version.as_deref(),
            Some("4.44.0")
        );
        assert!(spec.has_discovered_metadata());

        // Second application is a no-op
        let before = spec.clone();
        assert!(!spec.apply_discovered(&discovered()));
        assert_eq!(spec, before);
    }

    #[test]
    fn test_zero_max_tokens_ignored() {
        let mut spec = BaseModelSpec::default();
        let config = ModelConfig {
            max_tokens: Some(0),
            ..Default::default()
        };
        assert!(!spec.apply_discovered(&config));
        assert_eq!(spec.max_tokens, None);
    }

    #[test]
    fn test_cluster_spec_flattens() {
        let json = serde_json::json!({
            "modelType": "mistral",
            "storage": {"storageUri": "hf://mistralai/Mistral-7B"}
        });
        let spec: ClusterBaseModelSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.model_type.as_deref(), Some("mistral"));
        assert_eq!(spec.storage_uri(), Some("hf://mistralai/Mistral-7B"));
    }

    #[test]
    fn test_model_keys_per_scope() {
        let mut bm = BaseModel::new("llama", BaseModelSpec::default());
        bm.metadata.namespace = Some("team-a".to_string());
        assert_eq!(bm.model_key().config_map_key(), "team-a.basemodel.llama");

        let cbm = ClusterBaseModel::new("llama", ClusterBaseModelSpec::default());
        assert_eq!(cbm.model_key().config_map_key(), "clusterbasemodel.llama");
    }

    #[test]
    fn test_crds_generate() {
        assert_eq!(BaseModel::crd().spec.scope, "Namespaced");
        assert_eq!(ClusterBaseModel::crd().spec.scope, "Cluster");
    }
}
