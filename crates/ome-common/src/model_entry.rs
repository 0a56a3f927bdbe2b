//! Per-node model status records exchanged through ConfigMaps
//!
//! Every node agent owns one ConfigMap, named after the node and labeled
//! `ome.io/model-status=true`, in the operator namespace. Each data key
//! identifies a model and each value is a JSON-encoded [`ModelEntry`].
//! Older agents wrote the bare status string instead of JSON; both are read.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use aws_lc_rs::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kubernetes limit on ConfigMap data key length
pub const MAX_CONFIG_MAP_KEY_LENGTH: usize = 253;

/// Number of hex characters of the SHA-256 prefix used when truncating
pub const HASH_PREFIX_LENGTH: usize = 8;

/// Key segment identifying a namespaced BaseModel
pub const BASE_MODEL_KEY_TYPE: &str = "basemodel";

/// Key segment identifying a ClusterBaseModel
pub const CLUSTER_BASE_MODEL_KEY_TYPE: &str = "clusterbasemodel";

/// Errors decoding a ConfigMap value
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelEntryError {
    /// Neither JSON nor a known status tag
    #[error("unrecognized model status {0:?}")]
    UnknownStatus(String),
}

/// Status of a model on one node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelStatus {
    /// Downloaded and usable
    Ready,
    /// Download or update in progress
    Updating,
    /// Download or initialization failed
    Failed,
    /// Removed from the node
    Deleted,
}

impl ModelStatus {
    /// Wire representation of this status
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Ready => "Ready",
            ModelStatus::Updating => "Updating",
            ModelStatus::Failed => "Failed",
            ModelStatus::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelStatus {
    type Err = ModelEntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Ready" => Ok(ModelStatus::Ready),
            "Updating" => Ok(ModelStatus::Updating),
            "Failed" => Ok(ModelStatus::Failed),
            "Deleted" => Ok(ModelStatus::Deleted),
            other => Err(ModelEntryError::UnknownStatus(other.to_string())),
        }
    }
}

/// Model attributes discovered by a node agent or the metadata extractor
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// e.g. "llama", "mistral"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    /// e.g. "LlamaForCausalLM"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_architecture: Option<String>,
    /// `{"name": ..., "version": ...}`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_framework: BTreeMap<String, String>,
    /// `{"name": ..., "version": ...}`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_format: BTreeMap<String, String>,
    /// Human-readable size, e.g. "7.11B"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_parameter_size: Option<String>,
    /// Maximum context length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i32>,
    /// e.g. ["TEXT_GENERATION"]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub model_capabilities: Vec<String>,
    /// e.g. ["OPENAI_V1_CHAT_COMPLETIONS"]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_capabilities: Vec<String>,
}

impl ModelConfig {
    /// Framework name, if reported
    pub fn framework_name(&self) -> Option<&str> {
        non_empty(self.model_framework.get("name"))
    }

    /// Framework version, if reported
    pub fn framework_version(&self) -> Option<&str> {
        non_empty(self.model_framework.get("version"))
    }

    /// Format name, if reported
    pub fn format_name(&self) -> Option<&str> {
        non_empty(self.model_format.get("name"))
    }

    /// Format version, if reported
    pub fn format_version(&self) -> Option<&str> {
        non_empty(self.model_format.get("version"))
    }

    /// Build a config from the flat key/value pairs of a metadata ConfigMap.
    ///
    /// Keys follow the camelCase field names; list values are comma
    /// separated and the framework/format maps use `modelFrameworkName`,
    /// `modelFrameworkVersion`, `modelFormatName` and `modelFormatVersion`.
    pub fn from_flat_map(data: &BTreeMap<String, String>) -> Self {
        let get = |k: &str| non_empty(data.get(k)).map(str::to_string);
        let list = |k: &str| {
            data.get(k)
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let pair = |name: &str, version: &str| {
            let mut out = BTreeMap::new();
            if let Some(n) = get(name) {
                out.insert("name".to_string(), n);
                if let Some(v) = get(version) {
                    out.insert("version".to_string(), v);
                }
            }
            out
        };

        Self {
            model_type: get("modelType"),
            model_architecture: get("modelArchitecture"),
            model_framework: pair("modelFrameworkName", "modelFrameworkVersion"),
            model_format: pair("modelFormatName", "modelFormatVersion"),
            model_parameter_size: get("modelParameterSize"),
            max_tokens: data.get("maxTokens").and_then(|v| v.trim().parse().ok()),
            model_capabilities: list("modelCapabilities"),
            api_capabilities: list("apiCapabilities"),
        }
    }
}

impl ModelConfig {
    /// Inverse of [`ModelConfig::from_flat_map`]; unset fields are omitted
    pub fn to_flat_map(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let mut put = |k: &str, v: Option<&str>| {
            if let Some(v) = v.filter(|v| !v.is_empty()) {
                out.insert(k.to_string(), v.to_string());
            }
        };
        put("modelType", self.model_type.as_deref());
        put("modelArchitecture", self.model_architecture.as_deref());
        put("modelFrameworkName", self.framework_name());
        put("modelFrameworkVersion", self.framework_version());
        put("modelFormatName", self.format_name());
        put("modelFormatVersion", self.format_version());
        put("modelParameterSize", self.model_parameter_size.as_deref());
        put("maxTokens", self.max_tokens.map(|t| t.to_string()).as_deref());
        put("modelCapabilities", Some(self.model_capabilities.join(",").as_str()));
        put("apiCapabilities", Some(self.api_capabilities.join(",").as_str()));
        out
    }
}

fn non_empty(v: Option<&String>) -> Option<&str> {
    v.map(String::as_str).filter(|s| !s.is_empty())
}

/// One (node, model) status record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Model name
    #[serde(default)]
    pub name: String,
    /// Status on this node
    pub status: ModelStatus,
    /// Discovered configuration, absent when only tracking status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ModelConfig>,
}

impl ModelEntry {
    /// Entry that only carries a status
    pub fn with_status(status: ModelStatus) -> Self {
        Self {
            name: String::new(),
            status,
            config: None,
        }
    }

    /// Encode as the JSON string stored in the ConfigMap
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a ConfigMap value.
    ///
    /// A payload that is not a JSON object is read as a bare status tag.
    pub fn decode(raw: &str) -> Result<Self, ModelEntryError> {
        if let Ok(entry) = serde_json::from_str::<ModelEntry>(raw) {
            return Ok(entry);
        }
        // A JSON string literal ("Ready") is also a bare tag
        let tag = serde_json::from_str::<String>(raw).unwrap_or_else(|_| raw.to_string());
        tag.parse().map(Self::with_status)
    }
}

/// Identity of a model as encoded in a ConfigMap key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ModelKey {
    /// A namespaced BaseModel
    Namespaced {
        /// Model namespace
        namespace: String,
        /// Model name
        name: String,
    },
    /// A ClusterBaseModel
    Cluster {
        /// Model name
        name: String,
    },
}

impl ModelKey {
    /// Key for a BaseModel (`namespace` set) or ClusterBaseModel (`None`)
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) => ModelKey::Namespaced {
                namespace: ns.to_string(),
                name: name.to_string(),
            },
            None => ModelKey::Cluster {
                name: name.to_string(),
            },
        }
    }

    /// Model name
    pub fn name(&self) -> &str {
        match self {
            ModelKey::Namespaced { name, .. } | ModelKey::Cluster { name } => name,
        }
    }

    /// Model namespace, `None` for cluster-scoped models
    pub fn namespace(&self) -> Option<&str> {
        match self {
            ModelKey::Namespaced { namespace, .. } => Some(namespace),
            ModelKey::Cluster { .. } => None,
        }
    }

    /// ConfigMap data key for this model.
    ///
    /// Long names are shortened with a hash prefix so the key stays within
    /// [`MAX_CONFIG_MAP_KEY_LENGTH`] while remaining unique.
    pub fn config_map_key(&self) -> String {
        match self {
            ModelKey::Cluster { name } => {
                let max_name = MAX_CONFIG_MAP_KEY_LENGTH - CLUSTER_BASE_MODEL_KEY_TYPE.len() - 1;
                format!(
                    "{CLUSTER_BASE_MODEL_KEY_TYPE}.{}",
                    truncate_with_hash(name, max_name)
                )
            }
            ModelKey::Namespaced { namespace, name } => {
                // "<ns>.basemodel.<name>": two dots plus the type segment
                let available = MAX_CONFIG_MAP_KEY_LENGTH - BASE_MODEL_KEY_TYPE.len() - 2;
                if namespace.len() + name.len() <= available {
                    return format!("{namespace}.{BASE_MODEL_KEY_TYPE}.{name}");
                }

                let (ns_max, name_max) = if available < HASH_PREFIX_LENGTH * 2 {
                    let ns_max = available / 2;
                    (ns_max, available - ns_max)
                } else if namespace.len() <= HASH_PREFIX_LENGTH {
                    (namespace.len(), available - namespace.len())
                } else {
                    (HASH_PREFIX_LENGTH, available - HASH_PREFIX_LENGTH)
                };

                format!(
                    "{}.{BASE_MODEL_KEY_TYPE}.{}",
                    truncate_with_hash(namespace, ns_max),
                    truncate_with_hash(name, name_max)
                )
            }
        }
    }

    /// Parse a ConfigMap data key back into a model identity.
    ///
    /// Returns `None` for keys that do not follow either grammar.
    pub fn parse(key: &str) -> Option<Self> {
        if let Some(name) = key.strip_prefix(&format!("{CLUSTER_BASE_MODEL_KEY_TYPE}.")) {
            if name.is_empty() {
                return None;
            }
            return Some(ModelKey::Cluster {
                name: name.to_string(),
            });
        }

        let (namespace, name) = key.split_once(&format!(".{BASE_MODEL_KEY_TYPE}."))?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(ModelKey::Namespaced {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

/// Shorten `original` to at most `max_len` bytes as `<sha256 prefix>-<suffix>`.
///
/// Strings that already fit are returned unchanged.
pub fn truncate_with_hash(original: &str, max_len: usize) -> String {
    if original.len() <= max_len {
        return original.to_string();
    }

    let hash = digest(&SHA256, original.as_bytes());
    let hash_prefix: String = hash
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
        .chars()
        .take(HASH_PREFIX_LENGTH)
        .collect();

    if max_len <= HASH_PREFIX_LENGTH + 1 {
        return hash_prefix.chars().take(max_len).collect();
    }

    let suffix_len = max_len - HASH_PREFIX_LENGTH - 1;
    let mut start = original.len() - suffix_len;
    while !original.is_char_boundary(start) {
        start += 1;
    }
    format!("{hash_prefix}-{}", &original[start..])
}
