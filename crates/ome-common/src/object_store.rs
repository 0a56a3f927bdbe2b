//! Object storage abstraction used by the agents
//!
//! [`ObjectStore`] is the single interface every agent programs against.
//! Size-aware selection between a standard and a ranged multipart transfer,
//! bulk prefix downloads and local-copy validation are provided methods, so
//! a backend only implements the primitive operations.
//!
//! [`LocalObjectStore`] maps `oci://n/<ns>/b/<bucket>/o/<object>` onto a
//! directory tree. Agents use it against mounted buckets and tests use it
//! against temp dirs.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use aws_lc_rs::digest::{Context, SHA256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::storage_uri::{parse_oci, OciStorage};
use crate::{Error, Result};

const MIB: u64 = 1024 * 1024;

/// Default object size above which a multipart transfer is used
pub const DEFAULT_SIZE_THRESHOLD_MB: u64 = 100;
/// Default multipart chunk size
pub const DEFAULT_CHUNK_SIZE_MB: u64 = 8;
/// Default number of parallel chunk transfers
pub const DEFAULT_THREADS: usize = 100;

/// Location of an object (or prefix) in object storage
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectUri {
    /// Object storage namespace
    pub namespace: String,
    /// Bucket name
    pub bucket_name: String,
    /// Object name, or prefix when listing
    pub object_name: String,
}

impl ObjectUri {
    /// Build a URI for a concrete object
    pub fn new(
        namespace: impl Into<String>,
        bucket_name: impl Into<String>,
        object_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            bucket_name: bucket_name.into(),
            object_name: object_name.into(),
        }
    }

    /// Parse an `oci://` URI
    pub fn parse(uri: &str) -> Result<Self> {
        Ok(parse_oci(uri)?.into())
    }

    /// Same bucket, different object name
    pub fn with_object(&self, object_name: impl Into<String>) -> Self {
        Self {
            object_name: object_name.into(),
            ..self.clone()
        }
    }
}

impl From<OciStorage> for ObjectUri {
    fn from(oci: OciStorage) -> Self {
        Self {
            namespace: oci.namespace,
            bucket_name: oci.bucket,
            object_name: oci.prefix,
        }
    }
}

impl std::fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "oci://n/{}/b/{}/o/{}",
            self.namespace, self.bucket_name, self.object_name
        )
    }
}

/// Object attributes returned by [`ObjectStore::head_object`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Object name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Hex SHA-256 of the content, when the backend tracks it
    pub sha256: Option<String>,
}

/// How a single object is transferred
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DownloadMode {
    /// Always one sequential transfer
    Standard,
    /// Always a ranged parallel transfer
    Multipart,
    /// Multipart above the size threshold, standard below
    #[default]
    Auto,
}

/// Options controlling downloads and where files land locally
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Objects larger than this use multipart in [`DownloadMode::Auto`]
    pub size_threshold_mb: u64,
    /// Byte-range size for multipart transfers
    pub chunk_size_mb: u64,
    /// Maximum concurrent chunk transfers
    pub threads: usize,
    /// Transfer strategy
    pub mode: DownloadMode,
    /// Skip the transfer when an identical local copy already exists
    pub skip_if_valid: bool,
    /// Objects whose name contains any of these substrings are skipped
    pub exclude_patterns: Vec<String>,
    /// Strip this prefix from object names when computing local paths
    pub strip_prefix: Option<String>,
    /// Keep only the last path component of object names
    pub use_base_name_only: bool,
    /// Merge the target dir and object name on their overlapping segments
    pub join_with_tail_overlap: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            size_threshold_mb: DEFAULT_SIZE_THRESHOLD_MB,
            chunk_size_mb: DEFAULT_CHUNK_SIZE_MB,
            threads: DEFAULT_THREADS,
            mode: DownloadMode::Auto,
            skip_if_valid: false,
            exclude_patterns: Vec::new(),
            strip_prefix: None,
            use_base_name_only: false,
            join_with_tail_overlap: false,
        }
    }
}

impl DownloadOptions {
    /// Set the multipart size threshold
    pub fn size_threshold_mb(mut self, mb: u64) -> Self {
        self.size_threshold_mb = mb;
        self
    }

    /// Set the multipart chunk size
    pub fn chunk_size_mb(mut self, mb: u64) -> Self {
        self.chunk_size_mb = mb.max(1);
        self
    }

    /// Set the number of parallel chunk transfers
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Select the transfer strategy
    pub fn mode(mut self, mode: DownloadMode) -> Self {
        self.mode = mode;
        self
    }

    /// Skip objects whose local copy already matches
    pub fn skip_if_valid(mut self) -> Self {
        self.skip_if_valid = true;
        self
    }

    /// Skip objects whose name contains `pattern`
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    /// Strip `prefix` from object names
    pub fn strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip_prefix = Some(prefix.into());
        self
    }

    /// Flatten object names to their base name
    pub fn use_base_name_only(mut self) -> Self {
        self.use_base_name_only = true;
        self
    }

    /// Merge target dir and object path on overlapping segments
    pub fn join_with_tail_overlap(mut self) -> Self {
        self.join_with_tail_overlap = true;
        self
    }

    /// Whether `object_name` matches an exclude pattern
    pub fn is_excluded(&self, object_name: &str) -> bool {
        self.exclude_patterns
            .iter()
            .any(|p| !p.is_empty() && object_name.contains(p.as_str()))
    }

    fn use_multipart(&self, size: u64) -> bool {
        match self.mode {
            DownloadMode::Standard => false,
            DownloadMode::Multipart => true,
            DownloadMode::Auto => size > self.size_threshold_mb * MIB,
        }
    }
}

/// Object storage operations the agents depend on
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download one object to `target` with a single sequential transfer
    async fn download(&self, source: &ObjectUri, target: &Path) -> Result<()>;

    /// Download one object to `target` as parallel byte ranges.
    ///
    /// Chunks land in a pre-sized temp file that is renamed into place only
    /// after every range succeeded.
    async fn multipart_download(
        &self,
        source: &ObjectUri,
        target: &Path,
        opts: &DownloadOptions,
    ) -> Result<()>;

    /// Upload a local file with a single transfer
    async fn upload(&self, source: &Path, target: &ObjectUri) -> Result<()>;

    /// Upload a local file in parallel chunks
    async fn multipart_file_upload(
        &self,
        source: &Path,
        target: &ObjectUri,
        chunk_size_mb: u64,
        threads: usize,
    ) -> Result<()>;

    /// List objects whose names start with `prefix.object_name`
    async fn list_objects(&self, prefix: &ObjectUri) -> Result<Vec<ObjectMetadata>>;

    /// Fetch object attributes without the content
    async fn head_object(&self, source: &ObjectUri) -> Result<ObjectMetadata>;

    /// Whether `local` already holds exactly the content of `source`
    async fn is_local_copy_valid(&self, source: &ObjectUri, local: &Path) -> Result<bool> {
        let meta = self.head_object(source).await?;
        let Ok(stat) = tokio::fs::metadata(local).await else {
            return Ok(false);
        };
        if stat.len() != meta.size {
            return Ok(false);
        }
        match meta.sha256 {
            Some(expected) => Ok(sha256_file(local).await? == expected),
            None => Ok(true),
        }
    }

    /// Download one object into `target_dir`, choosing the strategy by size.
    ///
    /// Returns the local path, or `None` if the object was excluded.
    async fn smart_download(
        &self,
        source: &ObjectUri,
        target_dir: &Path,
        opts: &DownloadOptions,
    ) -> Result<Option<PathBuf>> {
        if opts.is_excluded(&source.object_name) {
            debug!(object = %source.object_name, "skipping excluded object");
            return Ok(None);
        }

        let target = compute_target_file_path(&source.object_name, target_dir, opts);
        if opts.skip_if_valid && self.is_local_copy_valid(source, &target).await? {
            info!(object = %source.object_name, path = %target.display(), "valid local copy exists, skipping download");
            return Ok(Some(target));
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let meta = self.head_object(source).await?;
        if opts.use_multipart(meta.size) {
            self.multipart_download(source, &target, opts).await?;
        } else {
            self.download(source, &target).await?;
        }
        Ok(Some(target))
    }

    /// Download every object under `prefix` into `target_dir`
    async fn download_prefix(
        &self,
        prefix: &ObjectUri,
        target_dir: &Path,
        opts: &DownloadOptions,
    ) -> Result<Vec<PathBuf>> {
        let objects = self.list_objects(prefix).await?;
        let mut out = Vec::with_capacity(objects.len());
        for object in objects {
            let source = prefix.with_object(object.name);
            if let Some(path) = self.smart_download(&source, target_dir, opts).await? {
                out.push(path);
            }
        }
        Ok(out)
    }

    /// Upload, switching to multipart above `threshold_mb`
    async fn smart_upload(
        &self,
        source: &Path,
        target: &ObjectUri,
        threshold_mb: u64,
        chunk_size_mb: u64,
        threads: usize,
    ) -> Result<()> {
        let size = tokio::fs::metadata(source).await?.len();
        if size > threshold_mb * MIB {
            self.multipart_file_upload(source, target, chunk_size_mb, threads)
                .await
        } else {
            self.upload(source, target).await
        }
    }
}

// =============================================================================
// Path helpers
// =============================================================================

/// Local path for `object_name` under `target_dir`.
///
/// Precedence: strip prefix, then base name only, then tail overlap, then a
/// plain join.
pub fn compute_target_file_path(
    object_name: &str,
    target_dir: &Path,
    opts: &DownloadOptions,
) -> PathBuf {
    if let Some(prefix) = &opts.strip_prefix {
        target_dir.join(trim_object_prefix(object_name, prefix))
    } else if opts.use_base_name_only {
        target_dir.join(object_base_name(object_name))
    } else if opts.join_with_tail_overlap {
        join_with_tail_overlap(target_dir, object_name)
    } else {
        target_dir.join(object_name.trim_start_matches('/'))
    }
}

/// Last path component of an object name
pub fn object_base_name(object_name: &str) -> &str {
    object_name
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(object_name)
}

/// Object name with `prefix` and any leading `/` removed
pub fn trim_object_prefix<'a>(object_name: &'a str, prefix: &str) -> &'a str {
    object_name
        .strip_prefix(prefix)
        .unwrap_or(object_name)
        .trim_start_matches('/')
}

/// Join `dir` and `object` merging the longest suffix of `dir` that is also a
/// prefix of `object`.
///
/// `join_with_tail_overlap("/a/b/c", "/b/c/d.txt") == "/a/b/c/d.txt"`
///
/// The result is absolute only when `dir` is.
pub fn join_with_tail_overlap(dir: impl AsRef<Path>, object: &str) -> PathBuf {
    let dir = dir.as_ref();
    let dir_parts = normal_segments(dir);
    let obj_parts = normal_segments(Path::new(object));

    let max = dir_parts.len().min(obj_parts.len());
    let overlap = (1..=max)
        .rev()
        .find(|&l| dir_parts[dir_parts.len() - l..] == obj_parts[..l])
        .unwrap_or(0);

    let mut out: PathBuf = dir
        .components()
        .take_while(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
        .collect();
    out.extend(&dir_parts);
    out.extend(&obj_parts[overlap..]);
    out
}

fn normal_segments(path: &Path) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(s) => out.push(s.to_string_lossy().into_owned()),
            Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    out
}

/// Hex SHA-256 of a file's content
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut ctx = Context::new(&SHA256);
    let mut buf = vec![0u8; MIB as usize];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ctx.update(&buf[..n]);
    }
    Ok(ctx
        .finish()
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

// =============================================================================
// Filesystem-backed store
// =============================================================================

/// [`ObjectStore`] over a local directory laid out as `<root>/<ns>/<bucket>/<object>`
#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_path(&self, uri: &ObjectUri) -> PathBuf {
        self.root.join(&uri.namespace).join(&uri.bucket_name)
    }

    fn object_path(&self, uri: &ObjectUri) -> Result<PathBuf> {
        if normal_segments(Path::new(&uri.object_name)).is_empty() {
            return Err(Error::storage_permanent(format!(
                "object name is empty in {uri}"
            )));
        }
        Ok(self
            .bucket_path(uri)
            .join(uri.object_name.trim_start_matches('/')))
    }

    async fn existing_object(&self, uri: &ObjectUri) -> Result<PathBuf> {
        let path = self.object_path(uri)?;
        match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => Ok(path),
            _ => Err(Error::storage_permanent(format!("object not found: {uri}"))),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn download(&self, source: &ObjectUri, target: &Path) -> Result<()> {
        let src = self.existing_object(source).await?;
        let tmp = temp_sibling(target);
        tokio::fs::copy(&src, &tmp).await?;
        tokio::fs::rename(&tmp, target).await?;
        debug!(object = %source, path = %target.display(), "downloaded object");
        Ok(())
    }

    async fn multipart_download(
        &self,
        source: &ObjectUri,
        target: &Path,
        opts: &DownloadOptions,
    ) -> Result<()> {
        let src = self.existing_object(source).await?;
        let tmp = temp_sibling(target);
        let result = copy_ranges(&src, &tmp, opts.chunk_size_mb * MIB, opts.threads).await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp, target).await?;
        info!(object = %source, path = %target.display(), "multipart download complete");
        Ok(())
    }

    async fn upload(&self, source: &Path, target: &ObjectUri) -> Result<()> {
        let dst = self.object_path(target)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = temp_sibling(&dst);
        tokio::fs::copy(source, &tmp).await?;
        tokio::fs::rename(&tmp, &dst).await?;
        info!(file = %source.display(), object = %target, "uploaded object");
        Ok(())
    }

    async fn multipart_file_upload(
        &self,
        source: &Path,
        target: &ObjectUri,
        chunk_size_mb: u64,
        threads: usize,
    ) -> Result<()> {
        let dst = self.object_path(target)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = temp_sibling(&dst);
        if let Err(e) = copy_ranges(source, &tmp, chunk_size_mb.max(1) * MIB, threads).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp, &dst).await?;
        info!(file = %source.display(), object = %target, "multipart upload complete");
        Ok(())
    }

    async fn list_objects(&self, prefix: &ObjectUri) -> Result<Vec<ObjectMetadata>> {
        let bucket = self.bucket_path(prefix);
        let wanted = prefix.object_name.trim_start_matches('/').to_string();
        let listed = tokio::task::spawn_blocking(move || -> Result<Vec<ObjectMetadata>> {
            let mut out = Vec::new();
            if !bucket.is_dir() {
                return Ok(out);
            }
            for entry in walkdir::WalkDir::new(&bucket).sort_by_file_name() {
                let entry = entry.map_err(|e| Error::storage(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&bucket)
                    .map_err(|e| Error::internal(e.to_string()))?
                    .to_string_lossy()
                    .replace('\\', "/");
                if rel.starts_with(&wanted) && !rel.contains(TEMP_MARKER) {
                    let size = entry.metadata().map_err(|e| Error::storage(e.to_string()))?.len();
                    out.push(ObjectMetadata {
                        name: rel,
                        size,
                        sha256: None,
                    });
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::internal(e.to_string()))??;
        Ok(listed)
    }

    async fn head_object(&self, source: &ObjectUri) -> Result<ObjectMetadata> {
        let path = self.existing_object(source).await?;
        let size = tokio::fs::metadata(&path).await?.len();
        Ok(ObjectMetadata {
            name: source.object_name.clone(),
            size,
            sha256: Some(sha256_file(&path).await?),
        })
    }
}

const TEMP_MARKER: &str = ".ome-partial";

fn temp_sibling(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_MARKER);
    target.with_file_name(name)
}

/// Copy `src` into a pre-sized `dst` as concurrent byte ranges
async fn copy_ranges(src: &Path, dst: &Path, chunk: u64, threads: usize) -> Result<()> {
    let size = tokio::fs::metadata(src).await?.len();
    {
        let file = tokio::fs::File::create(dst).await?;
        file.set_len(size).await?;
    }

    let limit = Arc::new(Semaphore::new(threads.max(1)));
    let mut tasks = tokio::task::JoinSet::new();
    let mut offset = 0u64;
    while offset < size {
        let len = chunk.min(size - offset);
        let permit = limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::internal(e.to_string()))?;
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        tasks.spawn(async move {
            let _permit = permit;
            copy_range(&src, &dst, offset, len).await
        });
        offset += len;
    }

    while let Some(joined) = tasks.join_next().await {
        joined.map_err(|e| Error::internal(e.to_string()))??;
    }
    Ok(())
}

async fn copy_range(src: &Path, dst: &Path, offset: u64, len: u64) -> Result<()> {
    let mut buf = vec![0u8; len as usize];
    let mut input = tokio::fs::File::open(src).await?;
    input.seek(std::io::SeekFrom::Start(offset)).await?;
    input.read_exact(&mut buf).await?;

    let mut output = tokio::fs::OpenOptions::new().write(true).open(dst).await?;
    output.seek(std::io::SeekFrom::Start(offset)).await?;
    output.write_all(&buf).await?;
    output.flush().await?;
    Ok(())
}
