//! Fine-tuned adapter sync
//!
//! Serving pods mount a manifest of adapters (a ConfigMap key) and this
//! agent keeps two local directories in line with it: zipped adapters as
//! downloaded, which double as presence markers, and their extracted
//! contents for the serving runtime. The manifest directory is watched
//! rather than the file because the kubelet swaps the file in by renaming
//! a symlink.

pub mod manifest;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use ome_common::object_store::{DownloadOptions, ObjectStore};
use ome_common::retry::{retry_with_backoff, RetryConfig};
use ome_common::{Error, Result};

use manifest::{existing_ids, read_manifest, ManifestEntry, SyncPlan};

/// Adapters above this size are downloaded in parts
pub const BIG_FILE_SIZE_MB: u64 = 200;
/// Part size for adapter downloads
pub const DOWNLOAD_CHUNK_SIZE_MB: u64 = 20;
/// Parallel parts per download
pub const DOWNLOAD_THREADS: usize = 12;
/// Download attempts per adapter
pub const DOWNLOAD_ATTEMPTS: u32 = 3;

/// Sync agent settings
#[derive(Args, Clone, Debug)]
pub struct AdapterSyncConfig {
    /// Mounted manifest file
    #[arg(long, env = "OME_AGENT_FINE_TUNED_WEIGHT_INFO_FILE_PATH")]
    pub manifest_path: PathBuf,

    /// Where extracted adapters go
    #[arg(long, env = "OME_AGENT_UNZIPPED_FINE_TUNED_WEIGHT_DIRECTORY")]
    pub unzipped_dir: PathBuf,

    /// Where downloaded zips are kept
    #[arg(long, env = "OME_AGENT_ZIPPED_FINE_TUNED_WEIGHT_DIRECTORY")]
    pub zipped_dir: PathBuf,

    /// Pause between download attempts
    #[arg(skip = Duration::from_secs(5))]
    pub retry_delay: Duration,

    /// Wait after a change event so a half-written manifest is not read
    #[arg(skip = Duration::from_secs(1))]
    pub debounce: Duration,
}

/// Keeps local adapter directories in line with the manifest
pub struct AdapterSync {
    config: AdapterSyncConfig,
    store: Arc<dyn ObjectStore>,
}

impl AdapterSync {
    #[allow(missing_docs)]
    pub fn new(config: AdapterSyncConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self { config, store }
    }

    /// Sync once, then on every manifest change until SIGTERM or SIGINT
    pub async fn run(&self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Sync once, then on every manifest change until `shutdown` resolves
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(manifest = %self.config.manifest_path.display(), "starting adapter sync");
        self.apply().await?;

        let watch_dir = self
            .config
            .manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let (_watcher, mut events) = watch(&watch_dir)?;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("termination signal received, stopping adapter sync");
                    return Ok(());
                }
                Some(event) = events.recv() => {
                    match event {
                        Ok(event) if is_change(&event) => {
                            debug!(?event, "manifest directory changed");
                            tokio::time::sleep(self.config.debounce).await;
                            while events.try_recv().is_ok() {}
                            self.apply().await?;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "manifest watcher error"),
                    }
                }
            }
        }
    }

    /// Converge the local directories on the manifest once
    pub async fn apply(&self) -> Result<SyncPlan> {
        let manifest = read_manifest(&self.config.manifest_path).await?;
        let zipped_dir = self.config.zipped_dir.clone();
        let existing = crate::archive::blocking(move || existing_ids(&zipped_dir)).await?;
        let plan = SyncPlan::diff(&manifest, &existing);
        if plan.is_empty() {
            debug!("adapters already in sync");
            return Ok(plan);
        }
        info!(add = plan.to_add.len(), delete = plan.to_delete.len(), "syncing adapters");

        for entry in &plan.to_add {
            self.add(entry).await?;
        }
        for id in &plan.to_delete {
            self.delete(id).await;
        }
        Ok(plan)
    }

    async fn add(&self, entry: &ManifestEntry) -> Result<()> {
        let source = entry.uri();
        info!(adapter = %entry.id(), object = %source, "downloading adapter");
        tokio::fs::create_dir_all(&self.config.zipped_dir).await?;

        let opts = DownloadOptions::default()
            .size_threshold_mb(BIG_FILE_SIZE_MB)
            .chunk_size_mb(DOWNLOAD_CHUNK_SIZE_MB)
            .threads(DOWNLOAD_THREADS)
            .use_base_name_only();
        let retry = RetryConfig::fixed(DOWNLOAD_ATTEMPTS, self.config.retry_delay);
        let zip = retry_with_backoff(&retry, "download adapter", || {
            self.store
                .smart_download(&source, &self.config.zipped_dir, &opts)
        })
        .await?
        .unwrap_or_else(|| self.config.zipped_dir.join(entry.id()));

        let dest = self.config.unzipped_dir.clone();
        let archive = zip.clone();
        crate::archive::blocking(move || crate::archive::unzip(&archive, &dest))
            .await
            .inspect_err(|e| error!(zip = %zip.display(), error = %e, "failed to unzip adapter"))?;
        info!(adapter = %entry.id(), "adapter ready");
        Ok(())
    }

    /// Removal failures are logged; the next sync retries them
    async fn delete(&self, id: &str) {
        info!(adapter = %id, "deleting adapter");
        let unzipped = self.config.unzipped_dir.clone();
        let needle = id.to_string();
        match crate::archive::blocking(move || remove_matching_files(&unzipped, &needle)).await {
            Ok(removed) => debug!(adapter = %id, removed, "removed extracted files"),
            Err(e) => error!(adapter = %id, error = %e, "failed to remove extracted files"),
        }
        let zip = self.config.zipped_dir.join(id);
        if let Err(e) = tokio::fs::remove_file(&zip).await {
            error!(zip = %zip.display(), error = %e, "failed to remove adapter zip");
        }
    }
}

/// Delete every file under `dir` whose name contains `needle`
fn remove_matching_files(dir: &Path, needle: &str) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|e| Error::storage_permanent(e.to_string()))?;
        if entry.file_type().is_file() && entry.file_name().to_string_lossy().contains(needle) {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn is_change(event: &Event) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
}

type WatchEvents = mpsc::UnboundedReceiver<notify::Result<Event>>;

fn watch(dir: &Path) -> Result<(RecommendedWatcher, WatchEvents)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
        let _ = tx.send(event);
    })
    .map_err(watch_error)?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(watch_error)?;
    Ok((watcher, rx))
}

fn watch_error(e: notify::Error) -> Error {
    Error::internal_with_context("adapter-sync", format!("file watcher: {e}"))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ome_common::object_store::LocalObjectStore;
    use std::io::Write;

    struct Fixture {
        _root: tempfile::TempDir,
        bucket_root: PathBuf,
        config: AdapterSyncConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let base = root.path().to_path_buf();
            std::fs::create_dir_all(base.join("manifest")).unwrap();
            let config = AdapterSyncConfig {
                manifest_path: base.join("manifest").join("models.json"),
                unzipped_dir: base.join("unzipped"),
                zipped_dir: base.join("zipped"),
                retry_delay: Duration::ZERO,
                debounce: Duration::from_millis(50),
            };
            Self {
                bucket_root: base.join("bucket"),
                _root: root,
                config,
            }
        }

        fn publish(&self, object: &str, files: &[(&str, &str)]) {
            let path = self.bucket_root.join("tenancy/adapters").join(object);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
            for (name, body) in files {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }

        fn write_manifest(&self, objects: &[&str]) {
            let entries: Vec<_> = objects
                .iter()
                .map(|o| serde_json::json!({"namespace": "tenancy", "bucket": "adapters", "object": o}))
                .collect();
            std::fs::write(
                &self.config.manifest_path,
                serde_json::to_string(&entries).unwrap(),
            )
            .unwrap();
        }

        fn agent(&self) -> AdapterSync {
            AdapterSync::new(
                self.config.clone(),
                Arc::new(LocalObjectStore::new(&self.bucket_root)),
            )
        }
    }

    /// Story: adapters are added, kept as zips, and removed when delisted
    #[tokio::test]
    async fn story_converge_on_manifest() {
        let fx = Fixture::new();
        fx.publish("ft/a1", &[("a1-adapter_model.bin", "w1"), ("a1-config.json", "{}")]);
        fx.publish("ft/a2", &[("a2-adapter_model.bin", "w2")]);
        fx.write_manifest(&["ft/a1", "ft/a2"]);
        let agent = fx.agent();

        let plan = agent.apply().await.unwrap();
        assert_eq!(plan.to_add.len(), 2);
        assert!(fx.config.zipped_dir.join("a1").exists());
        assert_eq!(
            std::fs::read_to_string(fx.config.unzipped_dir.join("a2-adapter_model.bin")).unwrap(),
            "w2"
        );

        assert!(agent.apply().await.unwrap().is_empty());

        fx.write_manifest(&["ft/a2"]);
        let plan = agent.apply().await.unwrap();
        assert!(plan.to_delete.contains("a1"));
        assert!(!fx.config.zipped_dir.join("a1").exists());
        assert!(!fx.config.unzipped_dir.join("a1-adapter_model.bin").exists());
        assert!(!fx.config.unzipped_dir.join("a1-config.json").exists());
        assert!(fx.config.unzipped_dir.join("a2-adapter_model.bin").exists());
    }

    #[tokio::test]
    async fn test_missing_adapter_fails_after_retries() {
        let fx = Fixture::new();
        fx.write_manifest(&["ft/ghost"]);
        assert!(fx.agent().apply().await.is_err());
        assert!(!fx.config.zipped_dir.join("ghost").exists());
    }

    #[tokio::test]
    async fn test_missing_manifest_is_an_error() {
        let fx = Fixture::new();
        assert!(fx.agent().apply().await.is_err());
    }

    #[test]
    fn test_remove_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a1-weights"), b"").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("x-a1"), b"").unwrap();
        std::fs::write(dir.path().join("a2-weights"), b"").unwrap();

        assert_eq!(remove_matching_files(dir.path(), "a1").unwrap(), 2);
        assert!(dir.path().join("a2-weights").exists());
        assert_eq!(remove_matching_files(&dir.path().join("absent"), "a1").unwrap(), 0);
    }

    /// Story: a manifest rewrite while running pulls in the new adapter
    #[tokio::test]
    async fn story_watch_picks_up_manifest_change() {
        let fx = Fixture::new();
        fx.publish("ft/a1", &[("a1-adapter_model.bin", "w1")]);
        fx.write_manifest(&[]);
        let agent = fx.agent();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let target = fx.config.unzipped_dir.join("a1-adapter_model.bin");
        let manifest_fx = &fx;
        let driver = async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            manifest_fx.write_manifest(&["ft/a1"]);
            for _ in 0..100 {
                if target.exists() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let _ = stop_tx.send(());
            target.exists()
        };
        let runner = agent.run_until(async {
            let _ = stop_rx.await;
        });

        let (synced, result) = tokio::join!(driver, runner);
        result.unwrap();
        assert!(synced);
    }
}
