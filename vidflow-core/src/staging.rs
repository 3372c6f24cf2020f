use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const STAGED_THUMBNAIL: &str = "thumb.jpg";
pub const HLS_DIR: &str = "hls";

/// Sidecar written next to a staged upload describing what intake left there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingManifest {
    pub original_file: String,
    pub original_name: String,
    pub extension: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl StagingManifest {
    pub async fn write(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = dir.join(MANIFEST_FILE);
        let payload = serde_json::to_vec_pretty(self)?;
        fs::write(&path, payload).await?;
        Ok(path)
    }

    /// Reads the manifest in `dir`; a missing file yields `None`.
    pub async fn load(dir: &Path) -> io::Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Staged thumbnail path, if intake recorded one and it is still on disk.
    pub fn thumbnail_path(&self, dir: &Path) -> Option<PathBuf> {
        self.thumbnail
            .as_ref()
            .map(|name| dir.join(name))
            .filter(|path| path.is_file())
    }
}

/// Directory owning a staged file (`<staging-root>/<id>/original.<ext>`).
pub fn staging_dir_of(local_path: &Path) -> Option<&Path> {
    local_path.parent().filter(|dir| !dir.as_os_str().is_empty())
}

/// Removes a staging directory. Failures are logged, never returned.
pub async fn remove_staging_dir(dir: &Path) {
    match fs::remove_dir_all(dir).await {
        Ok(()) => debug!(path = %dir.display(), "staging directory removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "failed to clean staging directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manifest_thumbnail_requires_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = StagingManifest {
            original_file: "original.mp4".into(),
            original_name: "holiday.mp4".into(),
            extension: "mp4".into(),
            mime_type: "video/mp4".into(),
            thumbnail: Some(STAGED_THUMBNAIL.into()),
        };
        manifest.write(dir.path()).await.unwrap();
        let loaded = StagingManifest::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert!(loaded.thumbnail_path(dir.path()).is_none());

        std::fs::write(dir.path().join(STAGED_THUMBNAIL), b"jpeg").unwrap();
        assert!(loaded.thumbnail_path(dir.path()).is_some());
    }

    #[tokio::test]
    async fn missing_manifest_and_dir_are_quiet() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StagingManifest::load(dir.path()).await.unwrap().is_none());
        let gone = dir.path().join("gone");
        remove_staging_dir(&gone).await;
        assert!(!gone.exists());
    }
}
