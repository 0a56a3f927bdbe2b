//! Training agent settings
//!
//! Everything comes from environment variables set by the sidecar injector;
//! the flags exist for running the agent by hand.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::Serialize;

use ome_common::crd::TrainingRuntimeType;
use ome_common::object_store::ObjectUri;
use ome_common::{Error, Result, MERGED_WEIGHT_SUFFIX};

/// How the training server updates the base model
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingStrategy {
    /// Full fine-tune of the last N layers
    Vanilla,
    /// T-Few
    Tfew,
    /// Low-rank adapters
    Lora,
}

/// How the fine-tuned model will be served
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServingStrategy {
    /// Serve merged weights
    Vanilla,
    /// Serve the adapter on top of the base model
    Lora,
}

/// Cohere hyperparameters
#[derive(Args, Clone, Debug, Default)]
pub struct CohereSettings {
    /// Fine-tune name
    #[arg(long = "cohere-name", env = "COHERE_FT_NAME")]
    pub name: Option<String>,
    /// Base model size tag
    #[arg(long = "cohere-size", env = "COHERE_FT_SIZE")]
    pub size: Option<String>,
    /// Training strategy
    #[arg(long = "cohere-strategy", env = "COHERE_FT_STRATEGY", value_enum)]
    pub strategy: Option<TrainingStrategy>,
    /// Number of epochs
    #[arg(long = "cohere-train-epochs", env = "COHERE_FT_TRAIN_EPOCHS")]
    pub train_epochs: Option<u32>,
    /// Learning rate
    #[arg(long = "cohere-learning-rate", env = "COHERE_FT_LEARNING_RATE")]
    pub learning_rate: Option<f64>,
    /// Batch size
    #[arg(long = "cohere-train-batch-size", env = "COHERE_FT_TRAIN_BATCH_SIZE")]
    pub train_batch_size: Option<u32>,
    /// Evaluations without improvement before stopping
    #[arg(long = "cohere-early-stopping-patience", env = "COHERE_FT_EARLY_STOPPING_PATIENCE")]
    pub early_stopping_patience: Option<u32>,
    /// Minimum improvement that resets patience
    #[arg(long = "cohere-early-stopping-threshold", env = "COHERE_FT_EARLY_STOPPING_THRESHOLD")]
    pub early_stopping_threshold: Option<f64>,
    /// Command-1 only
    #[arg(
        long = "cohere-log-train-status-every-steps",
        env = "COHERE_FT_LOG_TRAIN_STATUS_EVERY_STEPS"
    )]
    pub log_train_status_every_steps: Option<u32>,
    /// Command-1 vanilla only: how many trailing layers are trained
    #[arg(long = "cohere-n-last-layers", env = "COHERE_FT_N_LAST_LAYERS")]
    pub n_last_layers: Option<u32>,
    /// Command-R only
    #[arg(long = "cohere-base-model", env = "COHERE_FT_BASE_MODEL")]
    pub base_model: Option<String>,
    /// Command-R only
    #[arg(long = "cohere-serving-strategy", env = "COHERE_FT_SERVING_STRATEGY", value_enum)]
    pub serving_strategy: Option<ServingStrategy>,
    /// Command-R only
    #[arg(long = "cohere-tensor-parallel-size", env = "COHERE_FT_TENSOR_PARALLEL_SIZE")]
    pub tensor_parallel_size: Option<u32>,
    /// LoRA rank, sent only with the lora strategy
    #[arg(long = "cohere-lora-rank", env = "COHERE_FT_LORA_CONFIG_RANK")]
    pub lora_rank: Option<u32>,
    /// LoRA alpha, sent only with the lora strategy
    #[arg(long = "cohere-lora-alpha", env = "COHERE_FT_LORA_CONFIG_ALPHA")]
    pub lora_alpha: Option<u32>,
}

/// PEFT hyperparameters
#[derive(Args, Clone, Debug, Default)]
pub struct PeftSettings {
    /// Base model name
    #[arg(long = "peft-model-name", env = "PEFT_FT_MODEL_NAME")]
    pub model_name: Option<String>,
    /// Dataset file name inside the training data directory
    #[arg(long = "peft-train-dataset-file", env = "PEFT_FT_TRAIN_DATASET_FILE")]
    pub train_dataset_file: Option<String>,
    /// Steps between metric logs
    #[arg(
        long = "peft-log-model-metrics-interval-in-steps",
        env = "PEFT_FT_LOG_MODEL_METRICS_INTERVAL_IN_STEPS"
    )]
    pub log_model_metrics_interval_in_steps: Option<u32>,
    /// Adapter type, `LORA` enables the lora fields
    #[arg(long = "peft-type", env = "PEFT_FT_PEFT_TYPE")]
    pub peft_type: Option<String>,
    /// LoRA rank
    #[arg(long = "peft-lora-r", env = "PEFT_FT_LORA_R")]
    pub lora_r: Option<u32>,
    /// LoRA alpha
    #[arg(long = "peft-lora-alpha", env = "PEFT_FT_LORA_ALPHA")]
    pub lora_alpha: Option<u32>,
    /// LoRA dropout
    #[arg(long = "peft-lora-dropout", env = "PEFT_FT_LORA_DROPOUT")]
    pub lora_dropout: Option<f64>,
    /// Number of epochs
    #[arg(long = "peft-num-train-epochs", env = "PEFT_FT_NUM_TRAIN_EPOCHS")]
    pub num_train_epochs: Option<u32>,
    /// Learning rate
    #[arg(long = "peft-learning-rate", env = "PEFT_FT_LEARNING_RATE")]
    pub learning_rate: Option<f64>,
    /// Batch size
    #[arg(long = "peft-train-batch-size", env = "PEFT_FT_TRAIN_BATCH_SIZE")]
    pub train_batch_size: Option<u32>,
    /// Evaluations without improvement before stopping
    #[arg(long = "peft-early-stopping-patience", env = "PEFT_FT_EARLY_STOPPING_PATIENCE")]
    pub early_stopping_patience: Option<u32>,
    /// Minimum improvement that resets patience
    #[arg(long = "peft-early-stopping-threshold", env = "PEFT_FT_EARLY_STOPPING_THRESHOLD")]
    pub early_stopping_threshold: Option<f64>,
}

impl PeftSettings {
    /// Whether the adapter type is LoRA
    pub fn is_lora(&self) -> bool {
        self.peft_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("lora"))
    }
}

/// Full training agent configuration
#[derive(Args, Clone, Debug)]
pub struct TrainingConfig {
    /// Training server flavor
    #[arg(long, env = "RUNTIME", default_value = "cohere")]
    pub runtime: TrainingRuntimeType,

    /// TrainingJob name, for logs
    #[arg(long, env = "TRAINING_NAME", default_value = "")]
    pub training_name: String,

    /// Directory the training server writes its output to
    #[arg(long, env = "MODEL_DIRECTORY")]
    pub model_directory: PathBuf,

    /// Where the fine-tuned weights archive is written
    #[arg(long, env = "ZIPPED_MODEL_PATH")]
    pub zipped_model_path: PathBuf,

    /// Where the merged weights archive is written, defaults next to the weights archive
    #[arg(long, env = "ZIPPED_MERGED_MODEL_PATH")]
    pub zipped_merged_model_path: Option<PathBuf>,

    /// Object storage namespace of the output
    #[arg(long, env = "MODEL_NAMESPACE")]
    pub model_namespace: String,
    /// Bucket of the output
    #[arg(long, env = "MODEL_BUCKET_NAME")]
    pub model_bucket_name: String,
    /// Object name of the uploaded weights archive
    #[arg(long, env = "MODEL_OBJECT_NAME")]
    pub model_object_name: String,

    /// Local directory the dataset is downloaded into
    #[arg(long, env = "TRAINING_DATA_DIRECTORY")]
    pub training_data_directory: PathBuf,
    /// Object storage namespace of the dataset
    #[arg(long, env = "TRAINING_DATA_NAMESPACE")]
    pub training_data_namespace: String,
    /// Bucket of the dataset
    #[arg(long, env = "TRAINING_DATA_BUCKET_NAME")]
    pub training_data_bucket_name: String,
    /// Object name of the dataset
    #[arg(long, env = "TRAINING_DATA_OBJECT_NAME")]
    pub training_data_object_name: String,

    /// Object storage namespace of the metrics
    #[arg(long, env = "TRAINING_METRICS_NAMESPACE")]
    pub training_metrics_namespace: String,
    /// Bucket of the metrics
    #[arg(long, env = "TRAINING_METRICS_BUCKET_NAME")]
    pub training_metrics_bucket_name: String,
    /// Object name of the metrics
    #[arg(long, env = "TRAINING_METRICS_OBJECT_NAME")]
    pub training_metrics_object_name: String,

    /// Base URL of the training server
    #[arg(long, env = "TRAINING_SERVER_URL", default_value = "http://localhost:8000")]
    pub server_url: String,

    /// File the kubelet reads as the container termination message
    #[arg(long, env = "TERMINATION_LOG_PATH", default_value = "/dev/termination-log")]
    pub termination_log_path: PathBuf,

    /// Seconds between attempts to reach a server that is still starting
    #[arg(long, env = "TRAINING_RETRY_INTERVAL_SECS", default_value = "60")]
    pub retry_interval_secs: u64,

    /// Give up on a server that has not come up after this many seconds
    #[arg(long, env = "TRAINING_KICKOFF_TIMEOUT_SECS", default_value = "1800")]
    pub kickoff_timeout_secs: u64,

    /// Seconds between status polls
    #[arg(long, env = "TRAINING_POLL_INTERVAL_SECS", default_value = "60")]
    pub poll_interval_secs: u64,

    /// Cohere hyperparameters
    #[command(flatten)]
    pub cohere: CohereSettings,

    /// PEFT hyperparameters
    #[command(flatten)]
    pub peft: PeftSettings,
}

impl TrainingConfig {
    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("MODEL_NAMESPACE", &self.model_namespace),
            ("MODEL_BUCKET_NAME", &self.model_bucket_name),
            ("MODEL_OBJECT_NAME", &self.model_object_name),
            ("TRAINING_DATA_NAMESPACE", &self.training_data_namespace),
            ("TRAINING_DATA_BUCKET_NAME", &self.training_data_bucket_name),
            ("TRAINING_DATA_OBJECT_NAME", &self.training_data_object_name),
            ("TRAINING_METRICS_NAMESPACE", &self.training_metrics_namespace),
            ("TRAINING_METRICS_BUCKET_NAME", &self.training_metrics_bucket_name),
            ("TRAINING_METRICS_OBJECT_NAME", &self.training_metrics_object_name),
        ];
        if let Some((name, _)) = required.iter().find(|(_, v)| v.is_empty()) {
            return Err(Error::validation_for(
                "training-agent",
                format!("{name} must be set"),
            ));
        }

        match self.runtime {
            TrainingRuntimeType::Cohere | TrainingRuntimeType::CohereCommandR
                if self.cohere.strategy.is_none() =>
            {
                Err(Error::validation_for(
                    "training-agent",
                    "COHERE_FT_STRATEGY must be set for cohere runtimes",
                ))
            }
            TrainingRuntimeType::Cohere
                if self.cohere.strategy == Some(TrainingStrategy::Vanilla)
                    && self.cohere.n_last_layers.is_none() =>
            {
                Err(Error::validation_for(
                    "training-agent",
                    "COHERE_FT_N_LAST_LAYERS must be set for the vanilla strategy",
                ))
            }
            _ => Ok(()),
        }
    }

    /// Dataset location
    pub fn training_data_uri(&self) -> ObjectUri {
        ObjectUri::new(
            &self.training_data_namespace,
            &self.training_data_bucket_name,
            &self.training_data_object_name,
        )
    }

    /// Upload target of the fine-tuned weights
    pub fn model_uri(&self) -> ObjectUri {
        ObjectUri::new(
            &self.model_namespace,
            &self.model_bucket_name,
            &self.model_object_name,
        )
    }

    /// Upload target of the merged weights
    pub fn merged_model_uri(&self) -> ObjectUri {
        self.model_uri()
            .with_object(format!("{}{MERGED_WEIGHT_SUFFIX}", self.model_object_name))
    }

    /// Upload target of the training metrics
    pub fn metrics_uri(&self) -> ObjectUri {
        ObjectUri::new(
            &self.training_metrics_namespace,
            &self.training_metrics_bucket_name,
            &self.training_metrics_object_name,
        )
    }

    /// Local path of the merged weights archive
    pub fn merged_archive_path(&self) -> PathBuf {
        self.zipped_merged_model_path.clone().unwrap_or_else(|| {
            let mut path = self.zipped_model_path.clone().into_os_string();
            path.push(MERGED_WEIGHT_SUFFIX);
            PathBuf::from(path)
        })
    }

    /// Local file the metrics body is written to before upload
    pub fn metrics_file_path(&self) -> PathBuf {
        let name = ome_common::object_store::object_base_name(&self.training_metrics_object_name);
        let dir = self
            .zipped_model_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_default();
        dir.join(format!("{name}.json"))
    }

    /// Pause between kickoff attempts
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Bound on the kickoff retries
    pub fn kickoff_timeout(&self) -> Duration {
        Duration::from_secs(self.kickoff_timeout_secs)
    }

    /// Pause between status polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Settings for tests; every location points at `root`
    #[cfg(test)]
    pub fn for_testing(runtime: TrainingRuntimeType, root: &std::path::Path) -> Self {
        Self {
            runtime,
            training_name: "ft-1".to_string(),
            model_directory: root.join("model"),
            zipped_model_path: root.join("zipped").join("ft-weights"),
            zipped_merged_model_path: None,
            model_namespace: "tenancy".to_string(),
            model_bucket_name: "models".to_string(),
            model_object_name: "ft-weights".to_string(),
            training_data_directory: root.join("data"),
            training_data_namespace: "tenancy".to_string(),
            training_data_bucket_name: "datasets".to_string(),
            training_data_object_name: "train/data.jsonl".to_string(),
            training_metrics_namespace: "tenancy".to_string(),
            training_metrics_bucket_name: "metrics".to_string(),
            training_metrics_object_name: "ft-1/metrics".to_string(),
            server_url: "http://localhost:8000".to_string(),
            termination_log_path: root.join("termination-log"),
            retry_interval_secs: 0,
            kickoff_timeout_secs: 0,
            poll_interval_secs: 0,
            cohere: CohereSettings::default(),
            peft: PeftSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_locations() {
        let config = TrainingConfig::for_testing(TrainingRuntimeType::Peft, std::path::Path::new("/w"));
        assert_eq!(
            config.merged_model_uri().to_string(),
            "oci://n/tenancy/b/models/o/ft-weights-merged-weight"
        );
        assert_eq!(
            config.merged_archive_path(),
            PathBuf::from("/w/zipped/ft-weights-merged-weight")
        );
        assert_eq!(config.metrics_file_path(), PathBuf::from("/w/zipped/metrics.json"));
    }

    #[test]
    fn test_validate() {
        let mut config =
            TrainingConfig::for_testing(TrainingRuntimeType::Cohere, std::path::Path::new("/w"));
        assert!(config.validate().is_err());

        config.cohere.strategy = Some(TrainingStrategy::Vanilla);
        assert!(config.validate().is_err());
        config.cohere.n_last_layers = Some(2);
        assert!(config.validate().is_ok());

        config.model_bucket_name.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("MODEL_BUCKET_NAME"));
    }
}
