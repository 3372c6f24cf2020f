use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tracing::debug;

use super::{collect_files, ObjectStore, RetryPolicy, StorageError, StorageResult};

/// Object store rooted at a local directory. Keys map to relative paths.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base: Option<String>,
    retry: RetryPolicy,
    upload_concurrency: usize,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base: None,
            retry: RetryPolicy::none(),
            upload_concurrency: 8,
        }
    }

    pub fn with_public_base(mut self, base: impl Into<String>) -> Self {
        self.public_base = Some(base.into().trim_end_matches('/').to_string());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_upload_concurrency(mut self, value: usize) -> Self {
        self.upload_concurrency = value.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> StorageResult<String> {
        let target = self.resolve(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::io(parent, source))?;
        }
        fs::write(&target, bytes)
            .await
            .map_err(|source| StorageError::io(&target, source))?;
        debug!(target: "storage", key, bytes = bytes.len(), "object written");
        Ok(key.to_string())
    }
}

#[async_trait::async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload_file(
        &self,
        bytes: Vec<u8>,
        key: &str,
        _content_type: &str,
    ) -> StorageResult<String> {
        let bytes = bytes.as_slice();
        self.retry
            .run("put_object", key, move || self.write(key, bytes))
            .await
    }

    async fn upload_path(
        &self,
        local: &Path,
        key: &str,
        _content_type: &str,
    ) -> StorageResult<String> {
        self.retry
            .run("put_object", key, move || async move {
                let target = self.resolve(key)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|source| StorageError::io(parent, source))?;
                }
                fs::copy(local, &target)
                    .await
                    .map_err(|source| StorageError::io(local, source))?;
                Ok(key.to_string())
            })
            .await
    }

    async fn list_files(&self, prefix: &str) -> StorageResult<Vec<String>> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut keys: Vec<String> = collect_files(&self.root)?
            .into_iter()
            .map(|(_, key)| key)
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_file(&self, key: &str) -> StorageResult<()> {
        let target = self.resolve(key)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::io(&target, source)),
        }
    }

    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()> {
        for key in keys {
            self.delete_file(key).await?;
        }
        Ok(())
    }

    async fn public_url(&self, key: &str) -> StorageResult<String> {
        Ok(match &self.public_base {
            Some(base) => format!("{base}/{key}"),
            None => self.root.join(key).display().to_string(),
        })
    }

    async fn health_check(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StorageError::io(&self.root, source))
    }

    fn upload_concurrency(&self) -> usize {
        self.upload_concurrency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn directory_upload_and_prefix_delete() {
        let source = tempdir().unwrap();
        std::fs::write(source.path().join("master.m3u8"), b"#EXTM3U").unwrap();
        std::fs::write(source.path().join("segment_000.ts"), b"ts").unwrap();
        std::fs::write(source.path().join("segment_001.ts"), b"ts").unwrap();

        let root = tempdir().unwrap();
        let store = LocalObjectStore::new(root.path()).with_upload_concurrency(2);
        let playlist = store
            .upload_directory(source.path(), "videos/abc/")
            .await
            .unwrap();
        assert_eq!(playlist, "videos/abc/master.m3u8");
        assert!(root.path().join("videos/abc/segment_001.ts").exists());

        store
            .upload_file(b"keep".to_vec(), "videos/abcd/video.mp4", "video/mp4")
            .await
            .unwrap();
        let removed = store.delete_directory("videos/abc").await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(
            store.list_files("videos/").await.unwrap(),
            vec!["videos/abcd/video.mp4".to_string()]
        );
    }

    #[tokio::test]
    async fn keys_cannot_escape_root() {
        let root = tempdir().unwrap();
        let store = LocalObjectStore::new(root.path());
        let err = store
            .upload_file(b"x".to_vec(), "../outside.txt", "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn public_url_prefers_configured_base() {
        let store = LocalObjectStore::new("/srv/objects").with_public_base("https://cdn.test/");
        assert_eq!(
            store.public_url("videos/a/video.mp4").await.unwrap(),
            "https://cdn.test/videos/a/video.mp4"
        );
    }
}
