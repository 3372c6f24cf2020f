use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::staging::{remove_staging_dir, staging_dir_of};
use crate::storage::ObjectStore;
use crate::video::{SourceType, SqliteVideoStore, VideoAsset, VideoError, VideoStatus};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Video(#[from] VideoError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("video {0} not found")]
    NotFound(String),
    #[error("video {0} is being processed")]
    ProcessingInProgress(String),
    #[error("video {id} changed status during {operation}")]
    Conflict { id: String, operation: &'static str },
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Moderation actions on an asset, plus the cleanup each one implies.
pub struct Moderation {
    videos: SqliteVideoStore,
    orchestrator: Arc<Orchestrator>,
    storage: Arc<dyn ObjectStore>,
}

impl Moderation {
    pub fn new(
        videos: SqliteVideoStore,
        orchestrator: Arc<Orchestrator>,
        storage: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            videos,
            orchestrator,
            storage,
        }
    }

    /// Approves an asset. Uploads move to `pending_processing` and are
    /// enqueued; embeds publish immediately. Re-approving a pending upload
    /// only re-issues the enqueue.
    pub fn approve(&self, id: &str) -> LifecycleResult<VideoStatus> {
        let video = self.load(id)?;
        match (video.source_type, video.status) {
            (SourceType::Embed, _) => {
                self.videos.transition(id, VideoStatus::Approved)?;
                info!(target: "lifecycle", video_id = id, "embed approved");
                Ok(VideoStatus::Approved)
            }
            (SourceType::Upload, VideoStatus::PendingProcessing) => {
                self.orchestrator.add_to_queue(id)?;
                Ok(VideoStatus::PendingProcessing)
            }
            (SourceType::Upload, _) => {
                self.videos
                    .transition_from(id, VideoStatus::PendingApproval, VideoStatus::PendingProcessing)?;
                self.orchestrator.add_to_queue(id)?;
                info!(target: "lifecycle", video_id = id, "upload approved and queued");
                Ok(VideoStatus::PendingProcessing)
            }
        }
    }

    /// Rejects an asset that is not mid-pipeline. Its queued job and
    /// staging directory go with it.
    pub async fn reject(&self, id: &str, reason: &str) -> LifecycleResult<()> {
        let video = self.load(id)?;
        if video.status == VideoStatus::Processing {
            return Err(LifecycleError::ProcessingInProgress(id.to_string()));
        }
        let previous = self.videos.reject(id, reason)?;
        if previous == VideoStatus::PendingProcessing {
            self.orchestrator.remove_from_queue(id);
        }
        if previous.is_pre_processing() {
            remove_staged(&video).await;
        }
        info!(target: "lifecycle", video_id = id, reason, "video rejected");
        Ok(())
    }

    pub fn hide(&self, id: &str) -> LifecycleResult<()> {
        self.videos
            .transition_from(id, VideoStatus::Approved, VideoStatus::Hidden)?;
        Ok(())
    }

    pub fn unhide(&self, id: &str) -> LifecycleResult<()> {
        self.videos
            .transition_from(id, VideoStatus::Hidden, VideoStatus::Approved)?;
        Ok(())
    }

    /// Deletes an asset and whatever it still owns on disk or in storage.
    /// Refused while the asset is processing.
    pub async fn delete(&self, id: &str) -> LifecycleResult<()> {
        let video = self.load(id)?;
        let status = video.status;
        if status == VideoStatus::Processing {
            return Err(LifecycleError::ProcessingInProgress(id.to_string()));
        }
        if !self.videos.delete_in_status(id, status)? {
            return Err(LifecycleError::Conflict {
                id: id.to_string(),
                operation: "delete",
            });
        }

        if status == VideoStatus::PendingProcessing {
            self.orchestrator.remove_from_queue(id);
        }
        remove_staged(&video).await;
        if matches!(
            status,
            VideoStatus::Approved | VideoStatus::Hidden | VideoStatus::Rejected
        ) {
            let prefix = video.object_prefix();
            match self.storage.delete_directory(&prefix).await {
                Ok(removed) => {
                    info!(target: "lifecycle", video_id = id, removed, "stored objects deleted");
                }
                Err(err) => {
                    warn!(target: "lifecycle", video_id = id, prefix = %prefix, error = %err, "failed to delete stored objects");
                }
            }
        }
        info!(target: "lifecycle", video_id = id, status = %status, "video deleted");
        Ok(())
    }

    fn load(&self, id: &str) -> LifecycleResult<VideoAsset> {
        self.videos
            .fetch_by_id(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }
}

async fn remove_staged(video: &VideoAsset) {
    if let Some(dir) = video
        .local_path
        .as_deref()
        .and_then(|path| staging_dir_of(Path::new(path)))
    {
        remove_staging_dir(dir).await;
    }
}
