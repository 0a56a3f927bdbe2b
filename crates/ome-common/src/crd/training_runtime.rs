//! TrainingRuntime and ClusterTrainingRuntime CRDs
//!
//! A runtime is a JobSet template plus the policy knobs the training
//! controller fills in per job.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::preserve_unknown_fields;

/// Annotation on a runtime naming the training server flavor it runs
pub const TRAINING_RUNTIME_TYPE_ANNOTATION: &str = "ome.io/training-runtime-type";

/// Training server flavor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrainingRuntimeType {
    /// HuggingFace PEFT server
    Peft,
    /// Cohere command-1 server
    Cohere,
    /// Cohere command-R server
    CohereCommandR,
}

impl TrainingRuntimeType {
    /// Wire name used in annotations and agent flags
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Peft => "peft",
            Self::Cohere => "cohere",
            Self::CohereCommandR => "cohere-commandr",
        }
    }

    /// Whether the server also produces merged weights
    pub fn produces_merged_weights(&self) -> bool {
        matches!(self, Self::Peft | Self::CohereCommandR)
    }
}

impl fmt::Display for TrainingRuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrainingRuntimeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "peft" => Ok(Self::Peft),
            "cohere" => Ok(Self::Cohere),
            "cohere-commandr" => Ok(Self::CohereCommandR),
            other => Err(format!("unknown training runtime type: {other}")),
        }
    }
}

/// Runtime template and policies
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ome.io",
    version = "v1beta1",
    kind = "TrainingRuntime",
    plural = "trainingruntimes",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRuntimeSpec {
    /// Node count and framework policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml_policy: Option<MlPolicy>,

    /// Gang scheduling policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_group_policy: Option<PodGroupPolicy>,

    /// JobSet template
    #[serde(default)]
    pub template: JobSetTemplateSpec,

    /// Labels added to every job using this runtime
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations added to every job using this runtime
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Compartment the runtime belongs to
    #[serde(
        default,
        rename = "compartmentID",
        skip_serializing_if = "Option::is_none"
    )]
    pub compartment_id: Option<String>,
}

/// Template for the JobSet created per training job
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSetTemplateSpec {
    /// Labels and annotations of the JobSet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMetadata>,

    /// JobSet spec, passed through as-is
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub spec: serde_json::Value,
}

/// Metadata subset allowed on templates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct TemplateMetadata {
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Node count and framework-specific policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MlPolicy {
    /// Number of training nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_nodes: Option<i32>,
    /// torchrun settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torch: Option<TorchPolicy>,
}

/// torchrun settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TorchPolicy {
    /// Processes per node ("auto", "gpu" or a number)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_proc_per_node: Option<String>,
}

/// Gang scheduling policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodGroupPolicy {
    /// Seconds to wait for the whole gang before giving up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_timeout_seconds: Option<i32>,
}

/// Cluster-scoped runtime template
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ome.io",
    version = "v1beta1",
    kind = "ClusterTrainingRuntime",
    plural = "clustertrainingruntimes"
)]
pub struct ClusterTrainingRuntimeSpec {
    /// Same fields as a TrainingRuntime
    #[serde(flatten)]
    pub runtime: TrainingRuntimeSpec,
}

impl Deref for ClusterTrainingRuntimeSpec {
    type Target = TrainingRuntimeSpec;

    fn deref(&self) -> &TrainingRuntimeSpec {
        &self.runtime
    }
}

impl TrainingRuntimeSpec {
    /// Configured node count, 1 when unset
    pub fn num_nodes(&self) -> i32 {
        self.ml_policy
            .as_ref()
            .and_then(|p| p.num_nodes)
            .unwrap_or(1)
    }

    /// Flavor named by the runtime-type annotation, if recognized
    pub fn runtime_type(&self) -> Option<TrainingRuntimeType> {
        self.annotations
            .get(TRAINING_RUNTIME_TYPE_ANNOTATION)
            .and_then(|v| v.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_runtime_flattens_template() {
        let spec: ClusterTrainingRuntimeSpec = serde_json::from_value(serde_json::json!({
            "mlPolicy": {"numNodes": 2},
            "template": {"spec": {"replicatedJobs": [{"name": "trainer"}]}}
        }))
        .unwrap();
        assert_eq!(spec.num_nodes(), 2);
        assert_eq!(spec.template.spec["replicatedJobs"][0]["name"], "trainer");
    }

    #[test]
    fn test_runtime_type_from_annotation() {
        let mut spec = TrainingRuntimeSpec::default();
        assert_eq!(spec.runtime_type(), None);

        spec.annotations.insert(
            TRAINING_RUNTIME_TYPE_ANNOTATION.to_string(),
            "cohere-commandr".to_string(),
        );
        assert_eq!(spec.runtime_type(), Some(TrainingRuntimeType::CohereCommandR));
        assert!(TrainingRuntimeType::CohereCommandR.produces_merged_weights());
        assert!(!TrainingRuntimeType::Cohere.produces_merged_weights());
        assert!("tgi".parse::<TrainingRuntimeType>().is_err());
    }

    #[test]
    fn test_default_node_count() {
        assert_eq!(TrainingRuntimeSpec::default().num_nodes(), 1);
    }
}
