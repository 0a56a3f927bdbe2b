//! Parameter counts from safetensors headers

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use ome_common::{Error, Result};

/// Index file of a sharded checkpoint
pub const INDEX_FILE: &str = "model.safetensors.index.json";

const MAX_HEADER_BYTES: u64 = 10 * 1024 * 1024;
const METADATA_KEY: &str = "__metadata__";

#[derive(Deserialize)]
struct TensorInfo {
    #[serde(default)]
    shape: Vec<i64>,
}

#[derive(Deserialize)]
struct ShardIndex {
    #[serde(default)]
    weight_map: std::collections::BTreeMap<String, String>,
}

fn header_error(path: &Path, msg: impl std::fmt::Display) -> Error {
    Error::validation_for(path.display().to_string(), msg.to_string())
}

/// Parameters stored in one safetensors file, read from its JSON header
pub fn count_file(path: &Path) -> Result<u64> {
    let mut file = File::open(path)?;
    let mut len = [0u8; 8];
    file.read_exact(&mut len)?;
    let header_len = u64::from_le_bytes(len);
    if header_len > MAX_HEADER_BYTES {
        return Err(header_error(
            path,
            format!("header of {header_len} bytes exceeds {MAX_HEADER_BYTES}"),
        ));
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)?;
    let tensors: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&header)?;

    let mut total: u64 = 0;
    for (name, info) in tensors {
        if name == METADATA_KEY {
            continue;
        }
        let info: TensorInfo = serde_json::from_value(info)?;
        if info.shape.is_empty() {
            continue;
        }
        let mut count: u64 = 1;
        for dim in info.shape {
            let dim = u64::try_from(dim)
                .ok()
                .filter(|d| *d > 0)
                .ok_or_else(|| header_error(path, format!("tensor {name} has dimension {dim}")))?;
            count = count
                .checked_mul(dim)
                .ok_or_else(|| header_error(path, format!("tensor {name} overflows")))?;
        }
        total = total
            .checked_add(count)
            .ok_or_else(|| header_error(path, "parameter count overflows"))?;
    }
    Ok(total)
}

/// Parameters of the checkpoint in `dir`: every shard named by the index,
/// else every `*.safetensors` file. `None` when there are no safetensors.
pub fn count_dir(dir: &Path) -> Result<Option<u64>> {
    let index = dir.join(INDEX_FILE);
    let shards: BTreeSet<String> = if index.exists() {
        let parsed: ShardIndex = serde_json::from_slice(&std::fs::read(&index)?)?;
        if parsed.weight_map.is_empty() {
            return Err(header_error(&index, "weight_map is empty"));
        }
        parsed.weight_map.into_values().collect()
    } else {
        std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".safetensors"))
            .collect()
    };
    if shards.is_empty() {
        return Ok(None);
    }

    let mut total: u64 = 0;
    for shard in shards {
        total = total
            .checked_add(count_file(&dir.join(&shard))?)
            .ok_or_else(|| header_error(dir, "parameter count overflows"))?;
    }
    Ok(Some(total))
}

#[cfg(test)]
pub(crate) fn write_safetensors(path: &Path, tensors: &[(&str, &[i64])]) {
    let mut header = serde_json::Map::new();
    header.insert(
        METADATA_KEY.to_string(),
        serde_json::json!({"format": "pt"}),
    );
    for (name, shape) in tensors {
        header.insert(
            name.to_string(),
            serde_json::json!({"dtype": "BF16", "shape": shape, "data_offsets": [0, 0]}),
        );
    }
    let header = serde_json::to_vec(&header).unwrap();
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(&header);
    std::fs::write(path, bytes).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_safetensors(&path, &[("embed", &[32000, 4096]), ("norm", &[4096]), ("scalar", &[])]);
        assert_eq!(count_file(&path).unwrap(), 32000 * 4096 + 4096);
    }

    #[test]
    fn test_rejects_bad_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.safetensors");
        write_safetensors(&path, &[("w", &[0, 4])]);
        assert!(count_file(&path).is_err());

        std::fs::write(&path, u64::MAX.to_le_bytes()).unwrap();
        assert!(count_file(&path).is_err());
    }

    /// Story: a sharded checkpoint is counted through its index, each shard once
    #[test]
    fn story_sharded_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        write_safetensors(&dir.path().join("model-00001-of-00002.safetensors"), &[("a", &[10, 10])]);
        write_safetensors(&dir.path().join("model-00002-of-00002.safetensors"), &[("b", &[5])]);
        write_safetensors(&dir.path().join("stray.safetensors"), &[("c", &[1000])]);
        std::fs::write(
            dir.path().join(INDEX_FILE),
            r#"{"weight_map": {
                "a": "model-00001-of-00002.safetensors",
                "a2": "model-00001-of-00002.safetensors",
                "b": "model-00002-of-00002.safetensors"}}"#,
        )
        .unwrap();

        assert_eq!(count_dir(dir.path()).unwrap(), Some(105));
    }

    #[test]
    fn test_no_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pytorch_model.bin"), b"").unwrap();
        assert_eq!(count_dir(dir.path()).unwrap(), None);
    }
}
