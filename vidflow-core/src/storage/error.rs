use std::path::PathBuf;

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object storage credentials are not configured")]
    NotConfigured,
    #[error("{operation} failed for {key}: {message}")]
    Request {
        operation: &'static str,
        key: String,
        message: String,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to walk {path}: {message}")]
    Walk { path: PathBuf, message: String },
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("settings error: {0}")]
    Settings(#[from] crate::settings::SettingsError),
}

impl StorageError {
    pub(crate) fn request(
        operation: &'static str,
        key: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        StorageError::Request {
            operation,
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            source,
            path: path.into(),
        }
    }

    /// Configuration problems are not worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StorageError::NotConfigured | StorageError::InvalidKey(_) | StorageError::Settings(_)
        )
    }
}
