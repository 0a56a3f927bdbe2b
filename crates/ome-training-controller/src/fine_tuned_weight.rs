//! FineTunedWeight construction
//!
//! Every TrainingJob owns exactly one FineTunedWeight named after the job.
//! The weight is cluster-scoped, so it points back at the job through
//! `trainingJobRef` instead of an owner reference.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde::Deserialize;

use ome_common::crd::{
    FineTunedWeight, FineTunedWeightSpec, ObjectRef, StorageSpec, TrainingJob,
    TrainingRuntimeSpec,
};
use ome_common::storage_uri::OciStorage;
use ome_common::Error;

use crate::annotations::{keys, LORA_STRATEGY};

/// Prefix stripped from job names to name the weights
pub const TRAINING_JOB_NAME_PREFIX: &str = "trainingjob-";

/// Length workload names are cut to, leaving room for pod name suffixes
pub const SHORT_NAME_LEN: usize = 20;

/// Key in the operator ConfigMap holding [`TrainingSidecarConfig`] JSON
pub const TRAINING_SIDECAR_CONFIG_KEY: &str = "trainingSidecar";

/// Configuration flag telling serving that merged weights were uploaded
pub const MERGED_WEIGHTS_CONFIG_KEY: &str = "merged_weights";

/// Name of the FineTunedWeight produced by a job
pub fn fine_tuned_weight_name(job_name: &str) -> &str {
    job_name
        .strip_prefix(TRAINING_JOB_NAME_PREFIX)
        .filter(|rest| !rest.is_empty())
        .unwrap_or(job_name)
}

/// First [`SHORT_NAME_LEN`] characters of a job name
pub fn short_job_name(name: &str) -> &str {
    match name.char_indices().nth(SHORT_NAME_LEN) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}

/// Training sidecar settings from the operator ConfigMap
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TrainingSidecarConfig {
    /// Sidecar image
    pub image: String,
    /// Cloud region
    pub region: String,
    /// Object storage namespace for outputs
    pub namespace: String,
    /// Bucket receiving fine-tuned weights
    pub fine_tuned_model_bucket: String,
    /// Bucket receiving training metrics
    pub training_metrics_bucket: String,
    /// Compartment of the output objects
    pub compartment_id: String,
}

impl TrainingSidecarConfig {
    /// Parse the sidecar section of the operator ConfigMap.
    ///
    /// A missing key yields the defaults; malformed JSON is a validation
    /// error rather than a crash.
    pub fn from_config_map(cm: &ConfigMap) -> Result<Self, Error> {
        let Some(raw) = cm
            .data
            .as_ref()
            .and_then(|d| d.get(TRAINING_SIDECAR_CONFIG_KEY))
        else {
            return Ok(Self::default());
        };
        serde_json::from_str(raw).map_err(|e| {
            Error::validation_for(
                cm.name_any(),
                format!("unable to parse {TRAINING_SIDECAR_CONFIG_KEY}: {e}"),
            )
        })
    }
}

/// `configuration` blob of the weights: whether merged weights exist
pub fn weight_configuration(runtime: &TrainingRuntimeSpec) -> serde_json::Value {
    let merged = runtime
        .runtime_type()
        .is_some_and(|t| t.produces_merged_weights());
    let mut config = serde_json::Map::new();
    config.insert(
        MERGED_WEIGHTS_CONFIG_KEY.to_string(),
        serde_json::Value::Bool(merged),
    );
    serde_json::Value::Object(config)
}

/// Build the FineTunedWeight for a job
pub fn build_fine_tuned_weight(
    job: &TrainingJob,
    sidecar: &TrainingSidecarConfig,
    runtime: &TrainingRuntimeSpec,
) -> FineTunedWeight {
    let job_name = job.name_any();
    let name = fine_tuned_weight_name(&job_name).to_string();

    let model_type = job
        .hyperparameters()
        .get(keys::STRATEGY)
        .and_then(|v| v.as_str())
        .unwrap_or(LORA_STRATEGY)
        .to_string();

    let storage_uri = OciStorage {
        namespace: sidecar.namespace.clone(),
        bucket: sidecar.fine_tuned_model_bucket.clone(),
        prefix: name.clone(),
    }
    .to_string();

    FineTunedWeight::new(
        &name,
        FineTunedWeightSpec {
            base_model_ref: ObjectRef {
                name: job.input_model().map(str::to_string),
                namespace: None,
            },
            model_type: Some(model_type),
            hyper_parameters: job
                .spec
                .hyper_parameter_tuning_config
                .as_ref()
                .map(|h| h.parameters.clone()),
            configuration: Some(weight_configuration(runtime)),
            storage: Some(StorageSpec {
                storage_uri: Some(storage_uri),
                ..Default::default()
            }),
            training_job_ref: ObjectRef {
                name: Some(job_name),
                namespace: job.namespace(),
            },
            compartment_id: job.spec.compartment_id.clone(),
        },
    )
}
