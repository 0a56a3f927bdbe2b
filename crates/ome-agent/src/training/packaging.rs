//! Which trained files get archived, and under which names

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use ome_common::crd::TrainingRuntimeType;
use ome_common::{Error, Result};

use super::config::{ServingStrategy, TrainingConfig, TrainingStrategy};

/// Command-1 model config holding `decoder_layers`
pub const COHERE_CONFIG_PBTXT: &str = "config.pbtxt";

const PEFT_FT_WEIGHTS_DIR: &str = "output/fine-tuned-weights";
const PEFT_MERGED_WEIGHTS_DIR: &str = "output/base-peft-merged";
const COMMAND_R_TFEW_WEIGHTS_DIR: &str = "output/tfew_weights";
const COMMAND_R_LORA_WEIGHTS_DIR: &str = "output";
const COMMAND_R_MERGED_WEIGHTS_DIR: &str = "model/tensorrtllm";

/// What to pack out of the model directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArtifactPlan {
    /// The whole model directory
    WholeDirectory,
    /// Only the trained trailing layers of a command-1 model
    LastLayers {
        /// Total decoder layers of the base model
        total: u32,
        /// Layers that were trained
        trained: u32,
    },
    /// A weights directory plus a merged-weights directory, archived separately
    WeightsAndMerged {
        /// Relative to the model directory
        weights: PathBuf,
        /// Relative to the model directory
        merged: PathBuf,
    },
}

impl ArtifactPlan {
    /// Decide the plan; command-1 vanilla reads the layer count from disk
    pub fn for_config(config: &TrainingConfig) -> Result<Self> {
        let strategy = config.cohere.strategy;
        match config.runtime {
            TrainingRuntimeType::Peft => Ok(Self::weights_and_merged(
                PEFT_FT_WEIGHTS_DIR,
                PEFT_MERGED_WEIGHTS_DIR,
            )),
            TrainingRuntimeType::Cohere => match strategy {
                Some(TrainingStrategy::Vanilla) => {
                    let trained = config.cohere.n_last_layers.ok_or_else(|| {
                        Error::validation_for("training-agent", "n_last_layers is not set")
                    })?;
                    let pbtxt = config.model_directory.join(COHERE_CONFIG_PBTXT);
                    let content = std::fs::read_to_string(&pbtxt)?;
                    let total = decoder_layers(&content).ok_or_else(|| {
                        Error::storage_permanent(format!(
                            "no decoder_layers entry in {}",
                            pbtxt.display()
                        ))
                    })?;
                    Ok(Self::LastLayers { total, trained })
                }
                _ => Ok(Self::WholeDirectory),
            },
            TrainingRuntimeType::CohereCommandR => match (strategy, config.cohere.serving_strategy) {
                (Some(TrainingStrategy::Tfew), _) => Ok(Self::weights_and_merged(
                    COMMAND_R_TFEW_WEIGHTS_DIR,
                    COMMAND_R_MERGED_WEIGHTS_DIR,
                )),
                (Some(TrainingStrategy::Lora), Some(ServingStrategy::Vanilla)) => {
                    Ok(Self::weights_and_merged(
                        COMMAND_R_LORA_WEIGHTS_DIR,
                        COMMAND_R_MERGED_WEIGHTS_DIR,
                    ))
                }
                (Some(TrainingStrategy::Lora), Some(ServingStrategy::Lora)) => {
                    Ok(Self::WholeDirectory)
                }
                (strategy, serving) => Err(Error::validation_for(
                    "training-agent",
                    format!(
                        "unsupported command-R combination: strategy {strategy:?}, serving strategy {serving:?}"
                    ),
                )),
            },
        }
    }

    fn weights_and_merged(weights: &str, merged: &str) -> Self {
        Self::WeightsAndMerged {
            weights: PathBuf::from(weights),
            merged: PathBuf::from(merged),
        }
    }

    /// Whether a second, merged archive is produced and uploaded
    pub fn has_merged_weights(&self) -> bool {
        matches!(self, Self::WeightsAndMerged { .. })
    }

    /// Write the archives; returns the merged archive path when there is one
    pub fn pack(&self, config: &TrainingConfig) -> Result<Option<PathBuf>> {
        let model_dir = &config.model_directory;
        let dest = &config.zipped_model_path;
        match self {
            Self::WholeDirectory => {
                crate::archive::zip_directory(model_dir, dest)?;
                Ok(None)
            }
            Self::LastLayers { total, trained } => {
                let prefixes = layer_prefixes(*total, *trained);
                let packed = crate::archive::zip_files_with_prefixes(model_dir, dest, &prefixes)?;
                if packed == 0 {
                    return Err(Error::storage_permanent(format!(
                        "no trained layer files found in {}",
                        model_dir.display()
                    )));
                }
                Ok(None)
            }
            Self::WeightsAndMerged { weights, merged } => {
                crate::archive::zip_directory(&model_dir.join(weights), dest)?;
                let merged_dest = config.merged_archive_path();
                crate::archive::zip_directory(&model_dir.join(merged), &merged_dest)?;
                Ok(Some(merged_dest))
            }
        }
    }
}

/// Layer count from a command-1 config: the first quoted integer after the
/// `decoder_layers` key
pub fn decoder_layers(pbtxt: &str) -> Option<u32> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r#"(?s)decoder_layers.*?"(\d+)""#).ok())
        .as_ref()?;
    re.captures(pbtxt)?.get(1)?.as_str().parse().ok()
}

/// Path prefixes of the last `trained` of `total` layers
pub fn layer_prefixes(total: u32, trained: u32) -> Vec<String> {
    (total.saturating_sub(trained)..total)
        .map(|i| format!("1/model.layers.{i}."))
        .collect()
}

/// Ensure an archive exists before upload
pub fn require_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::storage_permanent(format!(
            "archive {} was not produced",
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PBTXT: &str = r#"
parameters {
  key: "decoder_layers"
  value: {
    string_value: "32"
  }
}
parameters {
  key: "hidden_size"
  value: { string_value: "4096" }
}
"#;

    #[test]
    fn test_decoder_layers() {
        assert_eq!(decoder_layers(PBTXT), Some(32));
        assert_eq!(decoder_layers("key: \"hidden_size\" \"4096\""), None);
        assert_eq!(decoder_layers("decoder_layers: \"abc\""), None);
    }

    #[test]
    fn test_layer_prefixes() {
        assert_eq!(
            layer_prefixes(32, 2),
            vec!["1/model.layers.30.", "1/model.layers.31."]
        );
        assert_eq!(layer_prefixes(2, 5).len(), 2);
        assert!(layer_prefixes(32, 0).is_empty());
    }

    #[test]
    fn test_plan_per_runtime() {
        let root = tempfile::tempdir().unwrap();
        let mut config = TrainingConfig::for_testing(TrainingRuntimeType::Peft, root.path());
        assert!(ArtifactPlan::for_config(&config).unwrap().has_merged_weights());

        config.runtime = TrainingRuntimeType::CohereCommandR;
        config.cohere.strategy = Some(TrainingStrategy::Lora);
        config.cohere.serving_strategy = Some(ServingStrategy::Lora);
        assert_eq!(
            ArtifactPlan::for_config(&config).unwrap(),
            ArtifactPlan::WholeDirectory
        );
        config.cohere.serving_strategy = Some(ServingStrategy::Vanilla);
        assert!(ArtifactPlan::for_config(&config).unwrap().has_merged_weights());

        config.runtime = TrainingRuntimeType::Cohere;
        config.cohere.strategy = Some(TrainingStrategy::Vanilla);
        config.cohere.n_last_layers = Some(2);
        std::fs::create_dir_all(&config.model_directory).unwrap();
        std::fs::write(config.model_directory.join(COHERE_CONFIG_PBTXT), PBTXT).unwrap();
        assert_eq!(
            ArtifactPlan::for_config(&config).unwrap(),
            ArtifactPlan::LastLayers {
                total: 32,
                trained: 2
            }
        );
    }

    /// Story: a command-1 vanilla run ships only its trained layers
    #[test]
    fn story_last_layers_are_packed() {
        let root = tempfile::tempdir().unwrap();
        let mut config = TrainingConfig::for_testing(TrainingRuntimeType::Cohere, root.path());
        config.cohere.strategy = Some(TrainingStrategy::Vanilla);
        config.cohere.n_last_layers = Some(1);
        let model = &config.model_directory;
        std::fs::create_dir_all(model.join("1")).unwrap();
        std::fs::write(model.join(COHERE_CONFIG_PBTXT), PBTXT).unwrap();
        std::fs::write(model.join("1/model.layers.31.weight"), "w").unwrap();
        std::fs::write(model.join("1/model.layers.3.weight"), "w").unwrap();

        let plan = ArtifactPlan::for_config(&config).unwrap();
        assert_eq!(plan.pack(&config).unwrap(), None);
        require_file(&config.zipped_model_path).unwrap();

        let mut zip =
            zip::ZipArchive::new(std::fs::File::open(&config.zipped_model_path).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);
        assert_eq!(zip.by_index(0).unwrap().name(), "1/model.layers.31.weight");
    }
}
