//! `/finetune` request bodies
//!
//! One variant per server flavor. The enum is untagged, so only the chosen
//! variant's fields reach the wire.

use serde::Serialize;

use ome_common::crd::TrainingRuntimeType;
use ome_common::{Error, Result};

use super::config::{ServingStrategy, TrainingConfig, TrainingStrategy};

/// LoRA block of the Cohere schema
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CohereLoraConfig {
    /// Adapter rank
    pub rank: Option<u32>,
    /// Adapter scaling
    pub alpha: Option<u32>,
}

/// Cohere command-1 and command-R body
#[derive(Clone, Debug, PartialEq, Serialize)]
#[allow(missing_docs)]
pub struct CohereFineTuneDetails {
    pub name: Option<String>,
    pub size: Option<String>,
    pub strategy: TrainingStrategy,
    pub train_epochs: Option<u32>,
    pub learning_rate: Option<f64>,
    pub train_batch_size: Option<u32>,
    pub early_stopping_patience: Option<u32>,
    pub early_stopping_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_train_status_every_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_last_layers: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serving_strategy: Option<ServingStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tensor_parallel_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_config: Option<CohereLoraConfig>,
}

/// PEFT server body
#[derive(Clone, Debug, PartialEq, Serialize)]
#[allow(missing_docs)]
pub struct PeftFineTuneDetails {
    pub model_name: Option<String>,
    pub train_dataset_file: Option<String>,
    pub log_model_metrics_interval_in_steps: Option<u32>,
    pub peft_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_r: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_alpha: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_dropout: Option<f64>,
    pub num_train_epochs: Option<u32>,
    pub learning_rate: Option<f64>,
    pub train_batch_size: Option<u32>,
    pub early_stopping_patience: Option<u32>,
    pub early_stopping_threshold: Option<f64>,
}

/// Body of `POST /finetune`
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FineTuneDetails {
    /// Cohere schema
    Cohere(CohereFineTuneDetails),
    /// PEFT schema
    Peft(PeftFineTuneDetails),
}

impl FineTuneDetails {
    /// Build the body for the configured runtime
    pub fn from_config(config: &TrainingConfig) -> Result<Self> {
        match config.runtime {
            TrainingRuntimeType::Cohere | TrainingRuntimeType::CohereCommandR => {
                let c = &config.cohere;
                let strategy = c.strategy.ok_or_else(|| {
                    Error::validation_for("training-agent", "cohere strategy is not set")
                })?;
                let command_r = config.runtime == TrainingRuntimeType::CohereCommandR;
                let lora_config = (strategy == TrainingStrategy::Lora).then(|| CohereLoraConfig {
                    rank: c.lora_rank,
                    alpha: c.lora_alpha,
                });
                Ok(Self::Cohere(CohereFineTuneDetails {
                    name: c.name.clone(),
                    size: c.size.clone(),
                    strategy,
                    train_epochs: c.train_epochs,
                    learning_rate: c.learning_rate,
                    train_batch_size: c.train_batch_size,
                    early_stopping_patience: c.early_stopping_patience,
                    early_stopping_threshold: c.early_stopping_threshold,
                    log_train_status_every_steps: c
                        .log_train_status_every_steps
                        .filter(|_| !command_r),
                    n_last_layers: c
                        .n_last_layers
                        .filter(|_| !command_r && strategy == TrainingStrategy::Vanilla),
                    base_model: c.base_model.clone().filter(|_| command_r),
                    serving_strategy: c.serving_strategy.filter(|_| command_r),
                    tensor_parallel_size: c.tensor_parallel_size.filter(|_| command_r),
                    lora_config,
                }))
            }
            TrainingRuntimeType::Peft => {
                let p = &config.peft;
                let lora = p.is_lora();
                Ok(Self::Peft(PeftFineTuneDetails {
                    model_name: p.model_name.clone(),
                    train_dataset_file: p.train_dataset_file.clone(),
                    log_model_metrics_interval_in_steps: p.log_model_metrics_interval_in_steps,
                    peft_type: p.peft_type.clone(),
                    lora_r: p.lora_r.filter(|_| lora),
                    lora_alpha: p.lora_alpha.filter(|_| lora),
                    lora_dropout: p.lora_dropout.filter(|_| lora),
                    num_train_epochs: p.num_train_epochs,
                    learning_rate: p.learning_rate,
                    train_batch_size: p.train_batch_size,
                    early_stopping_patience: p.early_stopping_patience,
                    early_stopping_threshold: p.early_stopping_threshold,
                }))
            }
        }
    }

    /// JSON body
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
