pub mod config;
pub mod error;
pub mod intake;
pub mod lifecycle;
pub mod media;
pub mod orchestrator;
pub mod queue;
pub mod runtime;
pub mod settings;
pub mod sqlite;
pub mod staging;
pub mod storage;
pub mod video;

pub use config::{load_vidflow_config, StorageBackend, VidflowConfig};
pub use error::{ConfigError, Result};
pub use intake::{
    IntakeError, IntakeResult, UploadFile, UploadIntake, UploadMetadata, UploadReceipt,
    UploadRequest,
};
pub use lifecycle::{LifecycleError, LifecycleResult, Moderation};
pub use media::{CommandExecutor, MediaEngine, MediaError, SystemCommandExecutor, VideoMetadata};
pub use orchestrator::{
    Orchestrator, OrchestratorError, ProcessingOutcome, Worker, WorkerOptions,
};
pub use queue::{JobQueue, JobStatus, ProcessingJob, QueueCounts, QueueError};
pub use runtime::{RuntimeError, RuntimeOverrides, Vidflow};
pub use settings::{Settings, SettingsCache, SettingsError, SettingsStore};
pub use storage::{LocalObjectStore, ObjectStore, S3ObjectStore, StorageError};
pub use video::{SourceType, SqliteVideoStore, VideoAsset, VideoError, VideoFilter, VideoStatus};
