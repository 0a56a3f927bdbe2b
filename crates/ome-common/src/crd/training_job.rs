//! TrainingJob CRD

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{is_condition_true, preserve_unknown_fields, Condition, StorageSpec};
use crate::OME_API_GROUP;

/// Condition type: runtime objects were created
pub const TRAIN_JOB_CREATED: &str = "Created";
/// Condition type: the job is suspended
pub const TRAIN_JOB_SUSPENDED: &str = "Suspended";
/// Condition type: the job finished successfully
pub const TRAIN_JOB_COMPLETE: &str = "Complete";
/// Condition type: the job failed
pub const TRAIN_JOB_FAILED: &str = "Failed";

/// Kind of a namespaced training runtime
pub const TRAINING_RUNTIME_KIND: &str = "TrainingRuntime";
/// Kind of a cluster-scoped training runtime
pub const CLUSTER_TRAINING_RUNTIME_KIND: &str = "ClusterTrainingRuntime";

/// Desired state of a training job
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ome.io",
    version = "v1beta1",
    kind = "TrainingJob",
    plural = "trainingjobs",
    shortname = "tj",
    namespaced,
    status = "TrainingJobStatus",
    printcolumn = r#"{"name":"Runtime","type":"string","jsonPath":".spec.runtimeRef.name"}"#,
    printcolumn = r#"{"name":"Model","type":"string","jsonPath":".spec.modelConfig.inputModel"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJobSpec {
    /// Runtime that materializes the workload
    pub runtime_ref: RuntimeRef,

    /// Trainer container overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trainer: Option<TrainerSpec>,

    /// Input and output model locations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_config: Option<TrainingModelConfig>,

    /// Training dataset location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasets: Option<StorageSpec>,

    /// Hyperparameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyper_parameter_tuning_config: Option<HyperparameterTuningConfig>,

    /// Pause the workload without deleting it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,

    /// Labels propagated to runtime objects
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations propagated to runtime objects
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Compartment the job belongs to
    #[serde(
        default,
        rename = "compartmentID",
        skip_serializing_if = "Option::is_none"
    )]
    pub compartment_id: Option<String>,
}

/// Reference to a TrainingRuntime or ClusterTrainingRuntime
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeRef {
    /// Runtime name
    pub name: String,
    /// API group, `ome.io` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    /// Kind, `ClusterTrainingRuntime` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl RuntimeRef {
    /// API group with the default applied
    pub fn api_group(&self) -> &str {
        self.api_group.as_deref().unwrap_or(OME_API_GROUP)
    }

    /// Kind with the default applied
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(CLUSTER_TRAINING_RUNTIME_KIND)
    }
}

/// Trainer container overrides
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrainerSpec {
    /// Image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Entrypoint override
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Arguments override
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Number of training nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_nodes: Option<i32>,
    /// Resources per node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_per_node: Option<ResourceRequirements>,
    /// Processes per node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_proc_per_node: Option<String>,
}

/// Hyperparameter configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HyperparameterTuningConfig {
    /// Search method
    #[serde(default)]
    pub method: String,
    /// Objective metric
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<MetricConfig>,
    /// Parameter map (epochs, learning_rate, strategy, ...)
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub parameters: serde_json::Value,
    /// Maximum trials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_trials: Option<i32>,
}

/// Objective metric of a tuning run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MetricConfig {
    /// Metric name
    pub name: String,
    /// "minimize" or "maximize"
    pub goal: String,
}

/// Input and output model of a training job
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrainingModelConfig {
    /// Name of the ClusterBaseModel to fine-tune
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_model: Option<String>,
    /// Where the fine-tuned weights are uploaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_model: Option<StorageSpec>,
}

/// Observed state of a training job
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJobStatus {
    /// Created, Suspended, Complete, Failed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Per replicated-job counters reported by the runtime
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs_status: Vec<ReplicatedJobStatus>,
}

/// Counters of one replicated job
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ReplicatedJobStatus {
    /// Replicated job name
    pub name: String,
    /// Ready pods
    #[serde(default)]
    pub ready: i32,
    /// Succeeded jobs
    #[serde(default)]
    pub succeeded: i32,
    /// Failed jobs
    #[serde(default)]
    pub failed: i32,
    /// Active jobs
    #[serde(default)]
    pub active: i32,
    /// Suspended jobs
    #[serde(default)]
    pub suspended: i32,
}

impl TrainingJob {
    /// Whether the spec asks for suspension
    pub fn is_suspended(&self) -> bool {
        self.spec.suspend.unwrap_or(false)
    }

    /// Whether the job reached Complete or Failed
    pub fn is_finished(&self) -> bool {
        self.is_complete() || self.is_failed()
    }

    /// Whether the Complete condition holds
    pub fn is_complete(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, TRAIN_JOB_COMPLETE))
    }

    /// Whether the Failed condition holds
    pub fn is_failed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, TRAIN_JOB_FAILED))
    }

    /// Hyperparameter map, empty when absent
    pub fn hyperparameters(&self) -> serde_json::Map<String, serde_json::Value> {
        self.spec
            .hyper_parameter_tuning_config
            .as_ref()
            .and_then(|h| h.parameters.as_object().cloned())
            .unwrap_or_default()
    }

    /// Name of the input ClusterBaseModel
    pub fn input_model(&self) -> Option<&str> {
        self.spec.model_config.as_ref()?.input_model.as_deref()
    }
}
