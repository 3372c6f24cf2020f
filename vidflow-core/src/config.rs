use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct VidflowConfig {
    pub paths: PathsSection,
    pub limits: LimitsSection,
    pub media: MediaSection,
    pub worker: WorkerSection,
    pub storage: StorageSection,
}

impl VidflowConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.staging_dir)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir)
    }

    pub fn videos_db(&self) -> PathBuf {
        self.data_dir().join("videos.sqlite")
    }

    pub fn jobs_db(&self) -> PathBuf {
        self.data_dir().join("jobs.sqlite")
    }

    pub fn settings_db(&self) -> PathBuf {
        self.data_dir().join("settings.sqlite")
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "worker.concurrency",
                reason: "must be at least 1".into(),
            });
        }
        if self.worker.hls_threshold_seconds <= 0 {
            return Err(ConfigError::Invalid {
                field: "worker.hls_threshold_seconds",
                reason: "must be positive".into(),
            });
        }
        if self.worker.lease_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "worker.lease_seconds",
                reason: "must be at least 1".into(),
            });
        }
        if self.storage.upload_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "storage.upload_concurrency",
                reason: "must be at least 1".into(),
            });
        }
        let [min, max] = self.storage.retry.delay_ms;
        if min > max {
            return Err(ConfigError::Invalid {
                field: "storage.retry.delay_ms",
                reason: format!("lower bound {min} exceeds upper bound {max}"),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub base_dir: String,
    pub staging_dir: String,
    pub data_dir: String,
    pub logs_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: ".".into(),
            staging_dir: "staging".into(),
            data_dir: "data".into(),
            logs_dir: "logs".into(),
        }
    }
}

/// Fallback values for the runtime settings store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub max_upload_size_mb: u64,
    pub max_video_duration: i64,
    pub max_files_per_upload: usize,
    pub allowed_mime_types: Vec<String>,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_upload_size_mb: 500,
            max_video_duration: 3600,
            max_files_per_upload: 2,
            allowed_mime_types: vec![
                "video/mp4".into(),
                "video/webm".into(),
                "video/quicktime".into(),
                "video/x-matroska".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaSection {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub command_timeout_seconds: Option<u64>,
}

impl MediaSection {
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_seconds
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
    }
}

impl Default for MediaSection {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            command_timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub hls_threshold_seconds: i64,
    pub recover_stale_on_start: bool,
    /// How long a claimed job stays owned without a renewal. Workers renew
    /// at a third of this while processing.
    pub lease_seconds: u64,
}

impl WorkerSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds.max(1))
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval_ms: 1_000,
            hls_threshold_seconds: 180,
            recover_stale_on_start: true,
            lease_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    S3,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub backend: StorageBackend,
    pub local_root: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub upload_concurrency: usize,
    pub retry: RetrySection,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            local_root: "objects".into(),
            endpoint: None,
            region: "auto".into(),
            upload_concurrency: 8,
            retry: RetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub attempts: u32,
    pub delay_ms: [u64; 2],
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: [200, 2_000],
        }
    }
}

pub fn load_vidflow_config<P: AsRef<Path>>(path: P) -> Result<VidflowConfig> {
    let config: VidflowConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
