//! What can be read out of a Hugging Face style `config.json`

use std::path::{Path, PathBuf};

use serde_json::Value;

use ome_common::model_entry::ModelConfig;
use ome_common::Result;

use super::safetensors;

/// Config file names, in lookup order
pub const CONFIG_FILES: [&str; 3] = ["config.json", "model_config.json", "configuration.json"];

/// Framework reported for Hugging Face checkpoints
pub const TRANSFORMERS_FRAMEWORK: &str = "transformers";

/// Capability of chat/completion models
pub const TEXT_GENERATION: &str = "TEXT_GENERATION";
/// Capability of embedding models
pub const TEXT_EMBEDDINGS: &str = "TEXT_EMBEDDINGS";
/// Capability of models with an image encoder
pub const VISION: &str = "VISION";

const CONTEXT_LENGTH_KEYS: [&str; 4] = [
    "max_position_embeddings",
    "n_positions",
    "max_sequence_length",
    "seq_length",
];

const GENERATION_HINTS: [&str; 8] = [
    "gpt", "llama", "llava", "mistral", "falcon", "opt", "bloom", "qwen",
];
const EMBEDDING_HINTS: [&str; 4] = ["bert", "sentence", "e5", "bge"];

/// First config file present in `model_dir`
pub fn find_config_file(model_dir: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| model_dir.join(name))
        .find(|path| path.is_file())
}

/// A parsed model config
#[derive(Clone, Debug)]
pub struct HfModelConfig {
    raw: Value,
}

impl HfModelConfig {
    #[allow(missing_docs)]
    pub fn from_value(raw: Value) -> Self {
        Self { raw }
    }

    /// Read and parse `path`
    pub fn load(path: &Path) -> Result<Self> {
        let raw = serde_json::from_slice(&std::fs::read(path)?)?;
        Ok(Self { raw })
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Look `key` up here, then in the nested `text_config` of multimodal models
    fn u64_field(&self, key: &str) -> Option<u64> {
        self.raw
            .get(key)
            .and_then(Value::as_u64)
            .or_else(|| self.raw.get("text_config")?.get(key)?.as_u64())
            .filter(|v| *v > 0)
    }

    /// `model_type`
    pub fn model_type(&self) -> Option<&str> {
        self.str_field("model_type")
    }

    /// First entry of `architectures`
    pub fn architecture(&self) -> Option<&str> {
        self.raw
            .get("architectures")?
            .as_array()?
            .first()?
            .as_str()
            .filter(|s| !s.is_empty())
    }

    /// Weight dtype, e.g. `bfloat16`
    pub fn torch_dtype(&self) -> Option<&str> {
        self.str_field("torch_dtype").or_else(|| self.str_field("dtype"))
    }

    /// Library version that wrote the config
    pub fn transformers_version(&self) -> Option<&str> {
        self.str_field("transformers_version")
    }

    /// Maximum sequence length the model was trained for
    pub fn context_length(&self) -> Option<u64> {
        CONTEXT_LENGTH_KEYS.iter().find_map(|k| self.u64_field(k))
    }

    /// Whether the model carries an image encoder
    pub fn has_vision(&self) -> bool {
        self.raw.get("vision_config").is_some_and(|v| !v.is_null())
    }

    /// Rough transformer size from the shape fields: embeddings plus
    /// about `12 * hidden^2` per layer
    pub fn estimated_parameters(&self) -> Option<u64> {
        let hidden = self.u64_field("hidden_size")?;
        let layers = self.u64_field("num_hidden_layers")?;
        let vocab = self.u64_field("vocab_size").unwrap_or(0);
        let embeddings = vocab.checked_mul(hidden)?;
        let per_layer = hidden.checked_mul(hidden)?.checked_mul(12)?;
        embeddings.checked_add(layers.checked_mul(per_layer)?)
    }

    /// Capabilities guessed from the architecture and model type;
    /// falls back to text generation
    pub fn capabilities(&self) -> Vec<String> {
        let arch = self.architecture().unwrap_or_default().to_lowercase();
        let model_type = self.model_type().unwrap_or_default().to_lowercase();
        let mut caps = Vec::new();

        if self.has_vision() {
            caps.push(VISION.to_string());
        }
        if arch.contains("causallm") || GENERATION_HINTS.iter().any(|h| model_type.contains(h)) {
            caps.push(TEXT_GENERATION.to_string());
        }
        if arch.contains("embedding") || EMBEDDING_HINTS.iter().any(|h| model_type.contains(h)) {
            caps.push(TEXT_EMBEDDINGS.to_string());
        }
        if caps.is_empty() {
            caps.push(TEXT_GENERATION.to_string());
        }
        caps
    }

    /// Everything the config and neighbouring checkpoint files reveal.
    ///
    /// The parameter count comes from safetensors headers in `model_dir`
    /// when present and from the shape fields otherwise.
    pub fn discover(&self, model_dir: &Path) -> ModelConfig {
        let parameters = match safetensors::count_dir(model_dir) {
            Ok(Some(count)) if count > 0 => Some(count),
            Ok(_) => self.estimated_parameters(),
            Err(e) => {
                tracing::warn!(error = %e, "cannot read safetensors headers, estimating size");
                self.estimated_parameters()
            }
        };

        let mut config = ModelConfig {
            model_type: self.model_type().map(str::to_string),
            model_architecture: self.architecture().map(str::to_string),
            model_parameter_size: parameters.filter(|p| *p > 0).map(format_param_count),
            max_tokens: self.context_length().and_then(|c| i32::try_from(c).ok()),
            model_capabilities: self.capabilities(),
            ..Default::default()
        };
        config
            .model_framework
            .insert("name".to_string(), TRANSFORMERS_FRAMEWORK.to_string());
        if let Some(version) = self.transformers_version() {
            config
                .model_framework
                .insert("version".to_string(), version.to_string());
        }
        if let Some(dtype) = self.torch_dtype() {
            config
                .model_format
                .insert("name".to_string(), dtype.to_string());
        }
        config
    }
}

/// Short size label: `7B`, `7.1B`, `7.11B`, `350M`, or the raw count below a thousand
pub fn format_param_count(count: u64) -> String {
    const UNITS: [(u64, &str); 4] = [
        (1_000_000_000_000, "T"),
        (1_000_000_000, "B"),
        (1_000_000, "M"),
        (1_000, "K"),
    ];
    let Some((scale, suffix)) = UNITS.iter().find(|(scale, _)| count >= *scale) else {
        return count.to_string();
    };

    // rounded to hundredths of the unit
    let hundredths = (u128::from(count) * 100 + u128::from(*scale) / 2) / u128::from(*scale);
    let (whole, frac) = (hundredths / 100, hundredths % 100);
    if frac == 0 {
        format!("{whole}{suffix}")
    } else if frac % 10 == 0 {
        format!("{whole}.{}{suffix}", frac / 10)
    } else {
        format!("{whole}.{frac:02}{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn llama() -> HfModelConfig {
        HfModelConfig::from_value(json!({
            "architectures": ["LlamaForCausalLM"],
            "model_type": "llama",
            "hidden_size": 4096,
            "num_hidden_layers": 32,
            "vocab_size": 32000,
            "max_position_embeddings": 4096,
            "torch_dtype": "bfloat16",
            "transformers_version": "4.44.0"
        }))
    }

    #[test]
    fn test_format_param_count() {
        assert_eq!(format_param_count(999), "999");
        assert_eq!(format_param_count(7_000_000_000), "7B");
        assert_eq!(format_param_count(7_100_000_000), "7.1B");
        assert_eq!(format_param_count(7_110_000_000), "7.11B");
        assert_eq!(format_param_count(6_738_415_616), "6.74B");
        assert_eq!(format_param_count(350_000_000), "350M");
        assert_eq!(format_param_count(1_500_000_000_000), "1.5T");
    }

    #[test]
    fn test_field_lookup() {
        let config = llama();
        assert_eq!(config.model_type(), Some("llama"));
        assert_eq!(config.architecture(), Some("LlamaForCausalLM"));
        assert_eq!(config.context_length(), Some(4096));
        assert_eq!(
            config.estimated_parameters(),
            Some(32000 * 4096 + 32 * 12 * 4096 * 4096)
        );

        let nested = HfModelConfig::from_value(json!({
            "model_type": "mllama",
            "text_config": {"max_position_embeddings": 131072},
            "vision_config": {"image_size": 560}
        }));
        assert_eq!(nested.context_length(), Some(131072));
        assert!(nested.has_vision());
        assert_eq!(nested.estimated_parameters(), None);
    }

    #[test]
    fn test_capability_heuristics() {
        assert_eq!(llama().capabilities(), vec![TEXT_GENERATION]);

        let bert = HfModelConfig::from_value(json!({"architectures": ["BertModel"], "model_type": "bert"}));
        assert_eq!(bert.capabilities(), vec![TEXT_EMBEDDINGS]);

        let llava = HfModelConfig::from_value(json!({"model_type": "llava", "vision_config": {}}));
        assert_eq!(llava.capabilities(), vec![VISION, TEXT_GENERATION]);

        let unknown = HfModelConfig::from_value(json!({"model_type": "mamba"}));
        assert_eq!(unknown.capabilities(), vec![TEXT_GENERATION]);
    }

    #[test]
    fn test_find_config_file_order() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_config_file(dir.path()).is_none());
        std::fs::write(dir.path().join("configuration.json"), "{}").unwrap();
        std::fs::write(dir.path().join("model_config.json"), "{}").unwrap();
        assert_eq!(
            find_config_file(dir.path()).unwrap(),
            dir.path().join("model_config.json")
        );
    }

    /// Story: safetensors headers win over the shape estimate
    #[test]
    fn story_discover_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        safetensors::write_safetensors(
            &dir.path().join("model.safetensors"),
            &[("w", &[1_000_000, 7_110])],
        );

        let config = llama().discover(dir.path());
        assert_eq!(config.model_parameter_size.as_deref(), Some("7.11B"));
        assert_eq!(config.max_tokens, Some(4096));
        assert_eq!(config.framework_name(), Some("transformers"));
        assert_eq!(config.framework_version(), Some("4.44.0"));
        assert_eq!(config.format_name(), Some("bfloat16"));

        let empty = tempfile::tempdir().unwrap();
        assert_eq!(
            llama().discover(empty.path()).model_parameter_size.as_deref(),
            Some("6.57B")
        );
    }
}
