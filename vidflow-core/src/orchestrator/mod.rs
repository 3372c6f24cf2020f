mod worker;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::media::{self, MediaEngine, MediaError};
use crate::queue::{JobQueue, ProcessingJob, QueueError};
use crate::settings::{SettingsCache, SettingsError};
use crate::staging::{remove_staging_dir, staging_dir_of, StagingManifest, HLS_DIR};
use crate::storage::{ObjectStore, StorageError};
use crate::video::{FinalizedMedia, SqliteVideoStore, VideoAsset, VideoError};

pub use worker::{Worker, WorkerOptions};

/// Rejection reason recorded when infrastructure fails mid-pipeline.
pub const PROCESSING_ERROR_REASON: &str = "Processing error";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Video(#[from] VideoError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("staged file has no parent directory: {0}")]
    MissingStagingDir(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// What `handle_video` did with an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessingOutcome {
    Skipped { video_id: String, reason: String },
    Published { video_id: String, video_url: String, hls: bool },
    Rejected { video_id: String, reason: String },
    Failed { video_id: String, error: String },
}

impl ProcessingOutcome {
    pub fn video_id(&self) -> &str {
        match self {
            ProcessingOutcome::Skipped { video_id, .. }
            | ProcessingOutcome::Published { video_id, .. }
            | ProcessingOutcome::Rejected { video_id, .. }
            | ProcessingOutcome::Failed { video_id, .. } => video_id,
        }
    }
}

/// Drives a staged upload through probe, validation, artwork, packaging,
/// upload and finalization.
pub struct Orchestrator {
    videos: SqliteVideoStore,
    queue: JobQueue,
    engine: MediaEngine,
    storage: Arc<dyn ObjectStore>,
    settings: SettingsCache,
    hls_threshold_seconds: i64,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("engine", &self.engine)
            .field("hls_threshold_seconds", &self.hls_threshold_seconds)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        videos: SqliteVideoStore,
        queue: JobQueue,
        engine: MediaEngine,
        storage: Arc<dyn ObjectStore>,
        settings: SettingsCache,
        hls_threshold_seconds: i64,
    ) -> Self {
        Self {
            videos,
            queue,
            engine,
            storage,
            settings,
            hls_threshold_seconds,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Enqueues `video_id` unless a job for it is already queued or active.
    pub fn add_to_queue(&self, video_id: &str) -> OrchestratorResult<bool> {
        Ok(self.queue.enqueue(video_id)?.is_some())
    }

    /// Best-effort removal of a queued job. Active jobs are untouched.
    pub fn remove_from_queue(&self, video_id: &str) -> bool {
        match self.queue.remove_queued(video_id) {
            Ok(removed) => removed,
            Err(err) => {
                warn!(target: "orchestrator", video_id, error = %err, "failed to remove queued job");
                false
            }
        }
    }

    /// Processes one asset. Errors never escape: failures mark the asset
    /// rejected and the staging directory is always removed.
    pub async fn handle_video(&self, video_id: &str) -> ProcessingOutcome {
        self.handle(video_id, false).await
    }

    /// Processes a claimed queue job. Redelivered jobs may find the asset
    /// still `processing` from the attempt that lost its lease.
    pub async fn handle_job(&self, job: &ProcessingJob) -> ProcessingOutcome {
        self.handle(&job.video_id, job.is_redelivery()).await
    }

    async fn handle(&self, video_id: &str, redelivered: bool) -> ProcessingOutcome {
        let video = match self.videos.fetch_by_id(video_id) {
            Ok(Some(video)) => video,
            Ok(None) => {
                warn!(target: "orchestrator", video_id, "video not found, skipping job");
                return skipped(video_id, "video not found");
            }
            Err(err) => {
                error!(target: "orchestrator", video_id, error = %err, "failed to load video");
                return ProcessingOutcome::Failed {
                    video_id: video_id.to_string(),
                    error: err.to_string(),
                };
            }
        };
        let Some(local_path) = video.local_path.clone().map(PathBuf::from) else {
            warn!(target: "orchestrator", video_id, "video has no staged file, skipping job");
            return skipped(video_id, "no staged file");
        };

        let started = if redelivered {
            self.videos.resume_processing(video_id)
        } else {
            self.videos.mark_processing(video_id)
        };
        let result = match started {
            Ok(_) => self.process(&video, &local_path).await,
            Err(VideoError::InvalidTransition { from, .. }) => {
                warn!(
                    target: "orchestrator",
                    video_id,
                    status = %from,
                    "video not ready for processing, skipping job"
                );
                return skipped(video_id, &format!("video is {from}"));
            }
            Err(err) => Err(err.into()),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(target: "orchestrator", video_id, error = %err, "processing failed");
                if let Err(reject_err) = self.videos.reject(video_id, PROCESSING_ERROR_REASON) {
                    error!(
                        target: "orchestrator",
                        video_id,
                        error = %reject_err,
                        "failed to record processing failure"
                    );
                }
                ProcessingOutcome::Failed {
                    video_id: video_id.to_string(),
                    error: err.to_string(),
                }
            }
        };

        if let Some(dir) = staging_dir_of(&local_path) {
            remove_staging_dir(dir).await;
        }
        outcome
    }

    async fn process(
        &self,
        video: &VideoAsset,
        local_path: &Path,
    ) -> OrchestratorResult<ProcessingOutcome> {
        let id = video.id.as_str();
        let staging_dir = staging_dir_of(local_path)
            .ok_or_else(|| OrchestratorError::MissingStagingDir(local_path.display().to_string()))?;

        info!(target: "orchestrator", video_id = id, "processing started");

        let metadata = self.engine.extract_metadata(local_path).await?;
        let settings = self.settings.current().await?;
        let validation = media::validate(&metadata, settings.max_video_duration);
        if !validation.valid {
            let reason = validation
                .error
                .unwrap_or_else(|| "Video failed validation".to_string());
            self.videos.reject(id, &reason)?;
            info!(target: "orchestrator", video_id = id, reason = %reason, "video rejected");
            return Ok(ProcessingOutcome::Rejected {
                video_id: id.to_string(),
                reason,
            });
        }

        let prefix = video.object_prefix();

        let manifest = StagingManifest::load(staging_dir)
            .await
            .map_err(|source| OrchestratorError::Io {
                source,
                path: staging_dir.to_path_buf(),
            })?;
        let thumbnail = match manifest.and_then(|m| m.thumbnail_path(staging_dir)) {
            Some(path) => path,
            None => {
                self.engine
                    .generate_thumbnail(local_path, staging_dir, &metadata)
                    .await?
            }
        };
        let thumbnail_key = self
            .storage
            .upload_path(
                &thumbnail,
                &format!("{prefix}/{}", media::THUMBNAIL_FILE),
                "image/jpeg",
            )
            .await?;
        let thumbnail_url = self.storage.public_url(&thumbnail_key).await?;

        let preview = self
            .engine
            .create_preview_gif(local_path, staging_dir, &metadata)
            .await?;
        let preview_key = self
            .storage
            .upload_path(
                &preview,
                &format!("{prefix}/{}", media::PREVIEW_FILE),
                "image/gif",
            )
            .await?;
        let storyboard_url = self.storage.public_url(&preview_key).await?;

        let hls = metadata.duration > self.hls_threshold_seconds;
        let video_key = if hls {
            let hls_dir = staging_dir.join(HLS_DIR);
            self.engine
                .transcode_to_hls(local_path, &hls_dir, &metadata)
                .await?;
            self.storage.upload_directory(&hls_dir, &prefix).await?
        } else {
            let mp4 = self.ensure_mp4(local_path, staging_dir).await?;
            self.storage
                .upload_path(&mp4, &format!("{prefix}/video.mp4"), "video/mp4")
                .await?
        };
        let video_url = self.storage.public_url(&video_key).await?;

        self.videos.finalize(
            id,
            &FinalizedMedia {
                video_url: video_url.clone(),
                video_key: prefix,
                thumbnail_url,
                storyboard_url,
                duration: metadata.duration,
                resolution: metadata.resolution.clone(),
            },
        )?;
        info!(
            target: "orchestrator",
            video_id = id,
            hls,
            duration = metadata.duration,
            "video published"
        );
        Ok(ProcessingOutcome::Published {
            video_id: id.to_string(),
            video_url,
            hls,
        })
    }

    /// MP4 sources upload as-is; other containers are stream-copied into MP4.
    async fn ensure_mp4(&self, local_path: &Path, staging_dir: &Path) -> OrchestratorResult<PathBuf> {
        let is_mp4 = local_path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("mp4"))
            .unwrap_or(false);
        if is_mp4 {
            return Ok(local_path.to_path_buf());
        }
        let target = staging_dir.join("video.mp4");
        Ok(self.engine.remux_to_mp4(local_path, &target).await?)
    }
}

fn skipped(video_id: &str, reason: &str) -> ProcessingOutcome {
    ProcessingOutcome::Skipped {
        video_id: video_id.to_string(),
        reason: reason.to_string(),
    }
}
