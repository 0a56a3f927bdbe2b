//! Annotations handed from a TrainingJob to its pods
//!
//! The pod mutators and the training sidecar read hyperparameters and data
//! locations from these annotations. They are computed fresh on every pass
//! and never written back to the TrainingJob itself.

use kube::ResourceExt;

use ome_common::crd::{
    ClusterBaseModel, TrainingJob, TrainingRuntimeSpec, TrainingRuntimeType,
    TRAINING_RUNTIME_TYPE_ANNOTATION,
};
use ome_common::storage_uri::{parse_oci, OciStorage};
use ome_common::{
    Error, BASE_MODEL_DECRYPTION_KEY_NAME, BASE_MODEL_DECRYPTION_SECRET_NAME,
    BASE_MODEL_TYPE_LABEL_KEY, MODEL_CATEGORY_ANNOTATION,
};

/// Pod annotation asking for the training sidecar
pub const TRAINING_SIDECAR_INJECTION: &str = "ome.io/inject-training-sidecar";
/// Pod annotation asking for the model init container
pub const MODEL_INIT_INJECTION: &str = "ome.io/inject-model-init";
/// Label value marking a base model pulled for fine-tuning
pub const FINE_TUNING_BASE_MODEL: &str = "FineTuning";

/// Vendor whose models need the init container and decryption keys
pub const COHERE_VENDOR: &str = "cohere";

/// Strategy value enabling LoRA
pub const LORA_STRATEGY: &str = "lora";
/// Strategy value training only the last layers
pub const VANILLA_STRATEGY: &str = "vanilla";

/// Hyperparameter and annotation keys
pub mod keys {
    /// Number of epochs
    pub const EPOCHS: &str = "epochs";
    /// Learning rate
    pub const LEARNING_RATE: &str = "learning_rate";
    /// Batch size
    pub const BATCH_SIZE: &str = "batch_size";
    /// Early stopping patience
    pub const EARLY_STOPPING_PATIENCE: &str = "early_stopping_patience";
    /// Early stopping threshold
    pub const EARLY_STOPPING_THRESHOLD: &str = "early_stopping_threshold";
    /// Fine-tuning strategy (lora, tfew, vanilla)
    pub const STRATEGY: &str = "strategy";
    /// LoRA rank
    pub const LORA_RANK: &str = "lora_r";
    /// LoRA alpha
    pub const LORA_ALPHA: &str = "lora_alpha";
    /// LoRA dropout
    pub const LORA_DROPOUT: &str = "lora_dropout";
    /// Steps between training log lines
    pub const LOG_TRAIN_STATUS_EVERY_STEPS: &str = "log_train_status_every_steps";
    /// Trained layer count for the vanilla strategy
    pub const N_LAST_LAYERS: &str = "n_last_layers";
    /// Tensor parallel degree
    pub const TENSOR_PARALLEL: &str = "tensor_parallel";
    /// On-behalf-of token passed through from the dataset parameters
    pub const OBO_TOKEN: &str = "obo_token";
    /// Dataset bucket
    pub const TRAINING_DATA_BUCKET: &str = "training_data_bucket";
    /// Dataset object storage namespace
    pub const TRAINING_DATA_NAMESPACE: &str = "training_data_namespace";
    /// Dataset object name
    pub const TRAINING_DATA_FILE_NAME: &str = "training_data_file_name";
    /// Base model object name
    pub const MODEL_NAME: &str = "model_name";
    /// Base model vendor
    pub const MODEL_VENDOR: &str = "model_vendor";
    /// Base model parameter size
    pub const MODEL_SIZE: &str = "model_size";
    /// Base model resource name
    pub const BASE_MODEL: &str = "base_model";
}

/// Read a hyperparameter as a string.
///
/// Numbers and booleans are rendered as written; a missing, null or
/// structured value is a validation error.
pub fn hyperparameter(job: &TrainingJob, key: &str) -> Result<String, Error> {
    let params = job.hyperparameters();
    match params.get(key) {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Ok(b.to_string()),
        Some(serde_json::Value::Null) | None => Err(Error::validation_for(
            job.name_any(),
            format!("missing hyperparameter {key}"),
        )
        .with_remediation(format!(
            "set spec.hyperParameterTuningConfig.parameters.{key}"
        ))),
        Some(other) => Err(Error::validation_for(
            job.name_any(),
            format!("hyperparameter {key} must be a scalar, got {other}"),
        )),
    }
}

/// Tensor parallel degree derived from the base model's size category
pub fn tensor_parallel_size(base_model: &ClusterBaseModel) -> Result<&'static str, Error> {
    let category = base_model
        .annotations()
        .get(MODEL_CATEGORY_ANNOTATION)
        .ok_or_else(|| {
            Error::validation_for(
                base_model.name_any(),
                format!("no model category annotation {MODEL_CATEGORY_ANNOTATION}"),
            )
        })?;
    Ok(match category.as_str() {
        "SMALL" => "1",
        "LARGE" => "4",
        _ => "0",
    })
}

/// Last path segment of an object storage URI
pub fn model_name_from_uri(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}

fn dataset_location(job: &TrainingJob) -> Result<OciStorage, Error> {
    let uri = job
        .spec
        .datasets
        .as_ref()
        .and_then(|d| d.storage_uri.as_deref())
        .ok_or_else(|| Error::validation_for(job.name_any(), "spec.datasets.storageUri is required"))?;
    parse_oci(uri).map_err(|e| Error::validation_for(job.name_any(), format!("dataset URI: {e}")))
}

/// Fill `job.spec.annotations` and `job.spec.labels` for the pod mutators.
///
/// Operates on an in-memory copy of the job; the caller hands that copy to
/// the runtime builder.
pub fn prepare_job_annotations(
    job: &mut TrainingJob,
    base_model: &ClusterBaseModel,
    runtime: &TrainingRuntimeSpec,
) -> Result<(), Error> {
    let mut out = std::mem::take(&mut job.spec.annotations);
    let vendor = base_model.spec.vendor.as_deref().unwrap_or_default();

    if vendor == COHERE_VENDOR {
        out.insert(MODEL_INIT_INJECTION.to_string(), "true".to_string());
        for key in [BASE_MODEL_DECRYPTION_KEY_NAME, BASE_MODEL_DECRYPTION_SECRET_NAME] {
            let value = base_model.annotations().get(key).cloned().unwrap_or_default();
            out.insert(key.to_string(), value);
        }
        job.spec.labels.insert(
            BASE_MODEL_TYPE_LABEL_KEY.to_string(),
            FINE_TUNING_BASE_MODEL.to_string(),
        );
    }
    out.insert(TRAINING_SIDECAR_INJECTION.to_string(), "true".to_string());

    let runtime_type = runtime
        .annotations
        .get(TRAINING_RUNTIME_TYPE_ANNOTATION)
        .cloned()
        .unwrap_or_default();
    out.insert(TRAINING_RUNTIME_TYPE_ANNOTATION.to_string(), runtime_type);

    if let Some(token) = job
        .spec
        .datasets
        .as_ref()
        .and_then(|d| d.parameters.get(keys::OBO_TOKEN))
    {
        out.insert(keys::OBO_TOKEN.to_string(), token.clone());
    }

    for key in [
        keys::EPOCHS,
        keys::LEARNING_RATE,
        keys::BATCH_SIZE,
        keys::EARLY_STOPPING_PATIENCE,
        keys::EARLY_STOPPING_THRESHOLD,
    ] {
        out.insert(key.to_string(), hyperparameter(job, key)?);
    }
    let strategy = hyperparameter(job, keys::STRATEGY)?;
    out.insert(keys::STRATEGY.to_string(), strategy.clone());

    let dataset = dataset_location(job)?;
    out.insert(keys::TRAINING_DATA_BUCKET.to_string(), dataset.bucket);
    out.insert(keys::TRAINING_DATA_NAMESPACE.to_string(), dataset.namespace);
    out.insert(keys::TRAINING_DATA_FILE_NAME.to_string(), dataset.prefix);

    let model_uri = base_model.spec.storage_uri().ok_or_else(|| {
        Error::validation_for(base_model.name_any(), "base model has no storage URI")
    })?;
    out.insert(
        keys::MODEL_NAME.to_string(),
        model_name_from_uri(model_uri).to_string(),
    );

    match runtime.runtime_type() {
        Some(TrainingRuntimeType::Peft) => {
            out.insert(keys::MODEL_VENDOR.to_string(), vendor.to_string());
            for key in [keys::LORA_RANK, keys::LORA_ALPHA, keys::LORA_DROPOUT] {
                out.insert(key.to_string(), hyperparameter(job, key)?);
            }
        }
        other => {
            let size = base_model.spec.model_parameter_size.clone().ok_or_else(|| {
                Error::validation_for(base_model.name_any(), "base model has no modelParameterSize")
            })?;
            out.insert(keys::MODEL_SIZE.to_string(), size);

            if other == Some(TrainingRuntimeType::Cohere) {
                out.insert(
                    keys::LOG_TRAIN_STATUS_EVERY_STEPS.to_string(),
                    hyperparameter(job, keys::LOG_TRAIN_STATUS_EVERY_STEPS)?,
                );
                if strategy == VANILLA_STRATEGY {
                    out.insert(
                        keys::N_LAST_LAYERS.to_string(),
                        hyperparameter(job, keys::N_LAST_LAYERS)?,
                    );
                }
            } else {
                out.insert(keys::BASE_MODEL.to_string(), base_model.name_any());
                out.insert(
                    keys::TENSOR_PARALLEL.to_string(),
                    tensor_parallel_size(base_model)?.to_string(),
                );
                if strategy == LORA_STRATEGY {
                    for key in [keys::LORA_RANK, keys::LORA_ALPHA] {
                        out.insert(key.to_string(), hyperparameter(job, key)?);
                    }
                }
            }
        }
    }

    job.spec.annotations = out;
    Ok(())
}
