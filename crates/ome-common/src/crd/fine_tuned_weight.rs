//! FineTunedWeight CRD
//!
//! Output handle of a training job. Created and updated only by the training
//! controller; its state mirrors the job.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{preserve_unknown_fields, LifeCycleState, ObjectRef, StorageSpec};

/// Description of fine-tuned weights
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ome.io",
    version = "v1beta1",
    kind = "FineTunedWeight",
    plural = "finetunedweights",
    shortname = "ftw",
    status = "FineTunedWeightStatus",
    printcolumn = r#"{"name":"BaseModel","type":"string","jsonPath":".spec.baseModelRef.name"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.modelType"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FineTunedWeightSpec {
    /// Model the weights were trained from
    #[serde(default)]
    pub base_model_ref: ObjectRef,

    /// Tuning strategy (e.g. "lora", "tfew", "vanilla")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,

    /// Hyperparameters the job ran with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub hyper_parameters: Option<serde_json::Value>,

    /// Flags for the serving side (e.g. `merged_weights`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub configuration: Option<serde_json::Value>,

    /// Where the weights are uploaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Training job that produced the weights
    #[serde(default)]
    pub training_job_ref: ObjectRef,

    /// Compartment the weights belong to
    #[serde(
        default,
        rename = "compartmentID",
        skip_serializing_if = "Option::is_none"
    )]
    pub compartment_id: Option<String>,
}

/// Observed state of fine-tuned weights
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FineTunedWeightStatus {
    /// Creating, Ready or Failed
    #[serde(default)]
    pub state: LifeCycleState,
}

impl FineTunedWeight {
    /// Current state, `None` before the controller first wrote status
    pub fn state(&self) -> Option<LifeCycleState> {
        self.status.as_ref().map(|s| s.state)
    }
}
