//! Fixtures shared by the unit tests

use std::collections::BTreeMap;

use ome_common::crd::{
    BaseModelSpec, ClusterBaseModel, ClusterBaseModelSpec, HyperparameterTuningConfig,
    JobSetTemplateSpec, MlPolicy, RuntimeRef, StorageSpec, TemplateMetadata, TrainingJob,
    TrainingJobSpec, TrainingModelConfig, TrainingRuntimeSpec, TRAINING_RUNTIME_TYPE_ANNOTATION,
};
use ome_common::{
    BASE_MODEL_DECRYPTION_KEY_NAME, BASE_MODEL_DECRYPTION_SECRET_NAME, MODEL_CATEGORY_ANNOTATION,
};

use crate::annotations::keys;

pub(crate) const JOB_NAMESPACE: &str = "tenant-a";
pub(crate) const JOB_NAME: &str = "trainingjob-ft-1";
pub(crate) const BASE_MODEL: &str = "llama-3-8b";

pub(crate) fn cluster_base_model(vendor: &str, category: Option<&str>) -> ClusterBaseModel {
    let mut model = ClusterBaseModel::new(
        BASE_MODEL,
        ClusterBaseModelSpec {
            model: BaseModelSpec {
                vendor: Some(vendor.to_string()),
                model_parameter_size: Some("8B".to_string()),
                storage: Some(StorageSpec {
                    storage_uri: Some("oci://n/models/b/base/o/meta/llama-3-8b".to_string()),
                    path: Some("/mnt/models/llama-3-8b".to_string()),
                    node_selector: BTreeMap::from([(
                        "node.kubernetes.io/instance-type".to_string(),
                        "BM.GPU.H100.8".to_string(),
                    )]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        },
    );
    let mut annotations = BTreeMap::from([
        (BASE_MODEL_DECRYPTION_KEY_NAME.to_string(), "key-1".to_string()),
        (BASE_MODEL_DECRYPTION_SECRET_NAME.to_string(), "dek-1".to_string()),
    ]);
    if let Some(c) = category {
        annotations.insert(MODEL_CATEGORY_ANNOTATION.to_string(), c.to_string());
    }
    model.metadata.annotations = Some(annotations);
    model
}

/// Hyperparameters every runtime needs, plus `extra`
pub(crate) fn params_with(extra: serde_json::Value) -> serde_json::Value {
    let mut params = serde_json::json!({
        "epochs": 3,
        "learning_rate": "0.0002",
        "batch_size": 8,
        "early_stopping_patience": 2,
        "early_stopping_threshold": 0.01,
    });
    if let (Some(base), Some(extra)) = (params.as_object_mut(), extra.as_object()) {
        base.extend(extra.clone());
    }
    params
}

pub(crate) fn peft_params() -> serde_json::Value {
    params_with(serde_json::json!({
        "strategy": "lora",
        "lora_r": 8,
        "lora_alpha": 16,
        "lora_dropout": 0.05,
    }))
}

pub(crate) fn training_job(params: serde_json::Value) -> TrainingJob {
    let mut job = TrainingJob::new(
        JOB_NAME,
        TrainingJobSpec {
            runtime_ref: RuntimeRef {
                name: "peft-runtime".to_string(),
                ..Default::default()
            },
            model_config: Some(TrainingModelConfig {
                input_model: Some(BASE_MODEL.to_string()),
                output_model: Some(StorageSpec {
                    storage_uri: Some("oci://n/tenant/b/output/o/ft-1".to_string()),
                    ..Default::default()
                }),
            }),
            datasets: Some(StorageSpec {
                storage_uri: Some("oci://n/tenant/b/datasets/o/train/data.jsonl".to_string()),
                storage_key: Some("dataset-creds".to_string()),
                parameters: BTreeMap::from([(keys::OBO_TOKEN.to_string(), "tok".to_string())]),
                ..Default::default()
            }),
            hyper_parameter_tuning_config: Some(HyperparameterTuningConfig {
                parameters: params,
                ..Default::default()
            }),
            labels: BTreeMap::from([("team".to_string(), "nlp".to_string())]),
            ..Default::default()
        },
    );
    job.metadata.namespace = Some(JOB_NAMESPACE.to_string());
    job.metadata.uid = Some("job-uid-1".to_string());
    job
}

/// JobSet template with an initializer and a trainer replicated job
pub(crate) fn jobset_template() -> serde_json::Value {
    serde_json::json!({
        "replicatedJobs": [
            {
                "name": "initializer",
                "template": {"spec": {"template": {"spec": {
                    "initContainers": [
                        {"name": "dataset-initializer", "image": "init:1",
                         "env": [{"name": "STORAGE_URI", "value": "stale"}, {"name": "RETRIES", "value": "3"}]},
                        {"name": "model-initializer", "image": "init:1"}
                    ],
                    "containers": [{"name": "noop", "image": "busybox"}]
                }}}}
            },
            {
                "name": "trainer-node",
                "template": {"spec": {"template": {"spec": {
                    "containers": [
                        {"name": "trainer", "image": "trainer:1",
                         "env": [{"name": "PET_NNODES", "value": "9"}, {"name": "KEEP", "value": "yes"}]}
                    ]
                }}}}
            }
        ]
    })
}

pub(crate) fn runtime_spec(runtime_type: &str) -> TrainingRuntimeSpec {
    TrainingRuntimeSpec {
        ml_policy: Some(MlPolicy {
            num_nodes: Some(2),
            torch: None,
        }),
        template: JobSetTemplateSpec {
            metadata: Some(TemplateMetadata {
                labels: BTreeMap::from([
                    ("team".to_string(), "platform".to_string()),
                    ("runtime".to_string(), runtime_type.to_string()),
                ]),
                annotations: BTreeMap::new(),
            }),
            spec: jobset_template(),
        },
        annotations: BTreeMap::from([(
            TRAINING_RUNTIME_TYPE_ANNOTATION.to_string(),
            runtime_type.to_string(),
        )]),
        ..Default::default()
    }
}
