//! Adapter manifest and the local mirror diff

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;
use walkdir::WalkDir;

use ome_common::object_store::{object_base_name, ObjectUri};
use ome_common::{Error, Result};

/// One adapter listed in the manifest
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ManifestEntry {
    /// Object storage namespace
    #[serde(alias = "Namespace")]
    pub namespace: String,
    /// Bucket holding the zipped adapter
    #[serde(alias = "bucketName", alias = "BucketName")]
    pub bucket: String,
    /// Object name of the zipped adapter
    #[serde(alias = "objectName", alias = "ObjectName")]
    pub object: String,
}

impl ManifestEntry {
    /// Local id: the object's base name, which is also the zip file name on disk
    pub fn id(&self) -> &str {
        object_base_name(&self.object)
    }

    /// Where the adapter lives in object storage
    pub fn uri(&self) -> ObjectUri {
        ObjectUri::new(&self.namespace, &self.bucket, &self.object)
    }
}

/// Parse the manifest file; an empty file means no adapters
pub async fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::storage_permanent(format!("failed to read manifest {}: {e}", path.display()))
    })?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).map_err(|e| {
        Error::validation_for(
            path.display().to_string(),
            format!("manifest is not a JSON array of adapters: {e}"),
        )
    })
}

/// Ids of adapters already present: extension-less files under the zipped directory
pub fn existing_ids(zipped_dir: &Path) -> Result<BTreeSet<String>> {
    if !zipped_dir.exists() {
        return Ok(BTreeSet::new());
    }
    let mut ids = BTreeSet::new();
    for entry in WalkDir::new(zipped_dir).min_depth(1) {
        let entry = entry.map_err(|e| Error::storage_permanent(e.to_string()))?;
        if entry.file_type().is_file() && entry.path().extension().is_none() {
            ids.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(ids)
}

/// What it takes to bring the local mirror in line with the manifest
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Listed but not on disk, in manifest order
    pub to_add: Vec<ManifestEntry>,
    /// On disk but no longer listed
    pub to_delete: BTreeSet<String>,
}

impl SyncPlan {
    /// Diff the manifest against the ids found locally
    pub fn diff(manifest: &[ManifestEntry], existing: &BTreeSet<String>) -> Self {
        let wanted: BTreeSet<&str> = manifest.iter().map(ManifestEntry::id).collect();

        let mut seen = BTreeSet::new();
        let to_add = manifest
            .iter()
            .filter(|e| !existing.contains(e.id()) && seen.insert(e.id().to_string()))
            .cloned()
            .collect();
        let to_delete = existing
            .iter()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();
        Self { to_add, to_delete }
    }

    /// Nothing to do
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_delete.is_empty()
    }
}
