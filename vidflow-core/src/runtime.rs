use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::VidflowConfig;
use crate::error::ConfigError;
use crate::intake::UploadIntake;
use crate::lifecycle::Moderation;
use crate::media::{CommandExecutor, MediaEngine};
use crate::orchestrator::{Orchestrator, Worker, WorkerOptions};
use crate::queue::{JobQueue, QueueError};
use crate::settings::{SettingsCache, SettingsError, SettingsStore};
use crate::storage::{build_object_store, ObjectStore};
use crate::video::{SqliteVideoStore, VideoError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Video(#[from] VideoError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Overrides for the collaborators `Vidflow::open` would otherwise build
/// from config.
#[derive(Default)]
pub struct RuntimeOverrides {
    pub executor: Option<Arc<dyn CommandExecutor>>,
    pub storage: Option<Arc<dyn ObjectStore>>,
}

/// Every service wired against one config: stores, engine, storage and the
/// intake, orchestration and moderation entry points.
pub struct Vidflow {
    pub config: VidflowConfig,
    pub settings: SettingsCache,
    pub videos: SqliteVideoStore,
    pub queue: JobQueue,
    pub engine: MediaEngine,
    pub storage: Arc<dyn ObjectStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub intake: UploadIntake,
    pub moderation: Moderation,
}

impl Vidflow {
    pub async fn open(config: VidflowConfig) -> RuntimeResult<Self> {
        Self::open_with(config, RuntimeOverrides::default()).await
    }

    pub async fn open_with(
        config: VidflowConfig,
        overrides: RuntimeOverrides,
    ) -> RuntimeResult<Self> {
        config.validate()?;
        for dir in [config.data_dir(), config.staging_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|source| RuntimeError::CreateDir { source, path: dir })?;
        }

        let settings_store = SettingsStore::new(config.settings_db())?;
        settings_store.initialize()?;
        let settings = SettingsCache::new(settings_store, config.limits.clone());
        settings.warm().await?;

        let videos = SqliteVideoStore::new(config.videos_db())?;
        videos.initialize()?;
        let queue = JobQueue::new(config.jobs_db())?;
        queue.initialize()?;

        let engine = MediaEngine::new(&config.media, overrides.executor);
        let storage = overrides.storage.unwrap_or_else(|| {
            build_object_store(
                &config.storage,
                config.resolve_path(&config.storage.local_root),
                settings.clone(),
            )
        });

        let orchestrator = Arc::new(Orchestrator::new(
            videos.clone(),
            queue.clone(),
            engine.clone(),
            Arc::clone(&storage),
            settings.clone(),
            config.worker.hls_threshold_seconds,
        ));
        let intake = UploadIntake::new(
            settings.clone(),
            videos.clone(),
            engine.clone(),
            Arc::clone(&storage),
            config.staging_dir(),
        );
        let moderation = Moderation::new(
            videos.clone(),
            Arc::clone(&orchestrator),
            Arc::clone(&storage),
        );
        info!(
            target: "runtime",
            data_dir = %config.data_dir().display(),
            staging_dir = %config.staging_dir().display(),
            "vidflow services ready"
        );

        Ok(Self {
            config,
            settings,
            videos,
            queue,
            engine,
            storage,
            orchestrator,
            intake,
            moderation,
        })
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            Arc::clone(&self.orchestrator),
            WorkerOptions::from_config(&self.config.worker),
        )
    }
}
