mod error;
mod local;
mod retry;
mod s3;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::info;
use walkdir::WalkDir;

use crate::config::{StorageBackend, StorageSection};
use crate::media::HLS_PLAYLIST;
use crate::settings::SettingsCache;

pub use error::{StorageError, StorageResult};
pub use local::LocalObjectStore;
pub use retry::RetryPolicy;
pub use s3::{r2_endpoint, S3ObjectStore};

/// Keys per `DeleteObjects` request.
pub const DELETE_BATCH_SIZE: usize = 1_000;

/// Gateway to an S3-compatible bucket. Keys are `/`-separated and never
/// start with a slash.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload_file(&self, bytes: Vec<u8>, key: &str, content_type: &str)
        -> StorageResult<String>;

    async fn upload_path(&self, local: &Path, key: &str, content_type: &str)
        -> StorageResult<String>;

    async fn list_files(&self, prefix: &str) -> StorageResult<Vec<String>>;

    async fn delete_file(&self, key: &str) -> StorageResult<()>;

    /// Removes up to [`DELETE_BATCH_SIZE`] keys in one request.
    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()>;

    /// Public URL clients use to fetch `key`.
    async fn public_url(&self, key: &str) -> StorageResult<String>;

    /// Cheap round trip proving the backend is reachable.
    async fn health_check(&self) -> StorageResult<()>;

    fn upload_concurrency(&self) -> usize {
        8
    }

    /// Uploads every file under `local_dir` to `prefix/<relative path>` and
    /// returns the key of the HLS playlist inside it.
    async fn upload_directory(&self, local_dir: &Path, prefix: &str) -> StorageResult<String> {
        let prefix = prefix.trim_end_matches('/');
        let files = collect_files(local_dir)?;
        let count = files.len();
        let uploads = files.into_iter().map(|(path, relative)| async move {
            let key = format!("{prefix}/{relative}");
            self.upload_path(&path, &key, content_type_for(&path)).await
        });
        stream::iter(uploads)
            .buffer_unordered(self.upload_concurrency().max(1))
            .try_collect::<Vec<_>>()
            .await?;
        info!(target: "storage", prefix, files = count, "directory uploaded");
        Ok(format!("{prefix}/{HLS_PLAYLIST}"))
    }

    /// Deletes every object under `prefix/` and returns how many were removed.
    async fn delete_directory(&self, prefix: &str) -> StorageResult<usize> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let keys = self.list_files(&prefix).await?;
        for chunk in keys.chunks(DELETE_BATCH_SIZE) {
            self.delete_batch(chunk).await?;
        }
        info!(target: "storage", prefix = %prefix, objects = keys.len(), "directory deleted");
        Ok(keys.len())
    }
}

/// Builds the backend selected in config.
pub fn build_object_store(
    config: &StorageSection,
    local_root: PathBuf,
    settings: SettingsCache,
) -> Arc<dyn ObjectStore> {
    match config.backend {
        StorageBackend::S3 => Arc::new(S3ObjectStore::new(config, settings)),
        StorageBackend::Local => Arc::new(
            LocalObjectStore::new(local_root)
                .with_retry(RetryPolicy::from(&config.retry))
                .with_upload_concurrency(config.upload_concurrency),
        ),
    }
}

pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "m3u8" => "application/vnd.apple.mpegurl",
        "ts" => "video/mp2t",
        "mp4" | "m4v" => "video/mp4",
        "m4s" => "video/iso.segment",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// Files under `root` paired with their `/`-joined relative path.
fn collect_files(root: &Path) -> StorageResult<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|err| StorageError::Walk {
            path: root.to_path_buf(),
            message: err.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|err| StorageError::Walk {
                path: entry.path().to_path_buf(),
                message: err.to_string(),
            })?
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), relative));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_cover_pipeline_outputs() {
        assert_eq!(
            content_type_for(Path::new("hls/master.m3u8")),
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(content_type_for(Path::new("segment_000.ts")), "video/mp2t");
        assert_eq!(content_type_for(Path::new("THUMB.JPG")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("preview.gif")), "image/gif");
        assert_eq!(content_type_for(Path::new("blob")), "application/octet-stream");
    }

    #[test]
    fn collect_files_keeps_nested_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("360p")).unwrap();
        std::fs::write(dir.path().join("master.m3u8"), b"#EXTM3U").unwrap();
        std::fs::write(dir.path().join("360p/segment_000.ts"), b"ts").unwrap();
        let files = collect_files(dir.path()).unwrap();
        let relative: Vec<_> = files.iter().map(|(_, rel)| rel.as_str()).collect();
        assert_eq!(relative, vec!["360p/segment_000.ts", "master.m3u8"]);
    }
}
