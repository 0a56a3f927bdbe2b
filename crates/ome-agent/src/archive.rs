//! Zip packing and unpacking of model directories
//!
//! These are blocking; async callers run them on the blocking pool.

use std::fs::File;
use std::io;
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use ome_common::{Error, Result};

fn zip_error(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::internal_with_context("archive", format!("{}: {e}", path.display()))
}

/// Pack every file under `src_dir` into `dest`, with paths relative to `src_dir`
pub fn zip_directory(src_dir: &Path, dest: &Path) -> Result<u64> {
    zip_matching(src_dir, dest, |_| true)
}

/// Pack only files whose relative path starts with one of `prefixes`
pub fn zip_files_with_prefixes(src_dir: &Path, dest: &Path, prefixes: &[String]) -> Result<u64> {
    zip_matching(src_dir, dest, |rel| {
        prefixes.iter().any(|p| rel.starts_with(p.as_str()))
    })
}

fn zip_matching(src_dir: &Path, dest: &Path, include: impl Fn(&str) -> bool) -> Result<u64> {
    if !src_dir.is_dir() {
        return Err(Error::storage_permanent(format!(
            "cannot zip {}: not a directory",
            src_dir.display()
        )));
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = ZipWriter::new(File::create(dest)?);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    let mut count = 0u64;
    for entry in WalkDir::new(src_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| zip_error(src_dir, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|e| zip_error(entry.path(), e))?
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        if !include(&rel) {
            continue;
        }

        writer
            .start_file(rel.as_str(), options)
            .map_err(|e| zip_error(dest, e))?;
        let mut file = File::open(entry.path())?;
        io::copy(&mut file, &mut writer)?;
        count += 1;
    }
    writer.finish().map_err(|e| zip_error(dest, e))?;

    debug!(src = %src_dir.display(), dest = %dest.display(), files = count, "zipped directory");
    Ok(count)
}

/// Extract `archive` into `dest_dir`
pub fn unzip(archive: &Path, dest_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dest_dir)?;
    let mut zip = ZipArchive::new(File::open(archive)?).map_err(|e| zip_error(archive, e))?;
    zip.extract(dest_dir).map_err(|e| zip_error(archive, e))?;
    debug!(archive = %archive.display(), dest = %dest_dir.display(), entries = zip.len(), "unzipped archive");
    Ok(())
}

/// Run a blocking archive operation off the async runtime
pub async fn blocking<T, F>(op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| Error::internal_with_context("archive", e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn names(archive: &Path) -> Vec<String> {
        let mut zip = ZipArchive::new(File::open(archive).unwrap()).unwrap();
        let mut out: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_zip_directory_then_unzip() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "config.json", "{}");
        write(src.path(), "weights/part-0.bin", "abc");

        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("ft.zip");
        assert_eq!(zip_directory(src.path(), &archive).unwrap(), 2);
        assert_eq!(names(&archive), vec!["config.json", "weights/part-0.bin"]);

        let dest = out.path().join("unzipped");
        unzip(&archive, &dest).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("weights/part-0.bin")).unwrap(),
            "abc"
        );
    }

    #[test]
    fn test_prefix_filter() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "1/model.layers.30.attn", "a");
        write(src.path(), "1/model.layers.31.mlp", "b");
        write(src.path(), "1/model.layers.3.attn", "c");
        write(src.path(), "config.pbtxt", "d");

        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("layers.zip");
        let prefixes = vec![
            "1/model.layers.30.".to_string(),
            "1/model.layers.31.".to_string(),
        ];
        assert_eq!(
            zip_files_with_prefixes(src.path(), &archive, &prefixes).unwrap(),
            2
        );
        assert_eq!(
            names(&archive),
            vec!["1/model.layers.30.attn", "1/model.layers.31.mlp"]
        );
    }

    #[test]
    fn test_missing_source_dir() {
        let out = tempfile::tempdir().unwrap();
        let err = zip_directory(&out.path().join("nope"), &out.path().join("x.zip")).unwrap_err();
        assert!(!err.is_retryable());
    }
}
