use std::path::PathBuf;

use thiserror::Error;

use super::models::VideoStatus;

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("video {id} not found")]
    NotFound { id: String },
    #[error("video {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: VideoStatus,
        to: VideoStatus,
    },
    #[error("unknown video status: {0}")]
    InvalidStatus(String),
    #[error("unknown source type: {0}")]
    InvalidSourceType(String),
    #[error("video store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

pub type VideoResult<T> = std::result::Result<T, VideoError>;
