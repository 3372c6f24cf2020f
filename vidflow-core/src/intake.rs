use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::ImageOutputFormat;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::media::{self, MediaEngine, MediaError};
use crate::settings::{Settings, SettingsCache, SettingsError};
use crate::staging::{remove_staging_dir, StagingManifest, STAGED_THUMBNAIL};
use crate::storage::{ObjectStore, StorageError};
use crate::video::{
    generate_short_code, generate_slug, NewVideo, SourceType, SqliteVideoStore, VideoAsset,
    VideoError,
};

const THUMBNAIL_JPEG_QUALITY: u8 = 85;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("a video file is required for uploads")]
    MissingVideoFile,
    #[error("embed uploads require an embed url")]
    MissingEmbedUrl,
    #[error("title must not be empty")]
    MissingTitle,
    #[error("too many files: {count} (max {max})")]
    TooManyFiles { count: usize, max: usize },
    #[error("file is {size} bytes, limit is {max} bytes")]
    FileTooLarge { size: u64, max: u64 },
    #[error("unsupported video type: {0}")]
    UnsupportedMimeType(String),
    #[error("thumbnail must be an image, got {0}")]
    InvalidThumbnailType(String),
    #[error("video rejected: {0}")]
    InvalidVideo(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("thumbnail conversion failed: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Video(#[from] VideoError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

pub type IntakeResult<T> = Result<T, IntakeError>;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> IntakeError + '_ {
    move |source| IntakeError::Io {
        source,
        path: path.to_path_buf(),
    }
}

#[derive(Debug, Clone)]
pub enum UploadContent {
    Bytes(Vec<u8>),
    /// A file already on local disk, copied into staging.
    Path(PathBuf),
}

#[derive(Debug, Clone)]
pub struct UploadFile {
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    pub content: UploadContent,
}

impl UploadFile {
    pub fn from_bytes(
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            size: bytes.len() as u64,
            content: UploadContent::Bytes(bytes),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>, mime_type: impl Into<String>) -> std::io::Result<Self> {
        let path = path.into();
        let size = std::fs::metadata(&path)?.len();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            file_name,
            mime_type: mime_type.into(),
            size,
            content: UploadContent::Path(path),
        })
    }

    /// Lowercased extension from the file name, falling back to the MIME type.
    pub fn extension(&self) -> String {
        Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|ch| ch.is_ascii_alphanumeric()))
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_else(|| extension_for_mime(&self.mime_type).to_string())
    }

    async fn read_bytes(&self) -> IntakeResult<Vec<u8>> {
        match &self.content {
            UploadContent::Bytes(bytes) => Ok(bytes.clone()),
            UploadContent::Path(path) => fs::read(path).await.map_err(io_error(path)),
        }
    }

    async fn write_to(&self, target: &Path) -> IntakeResult<()> {
        match &self.content {
            UploadContent::Bytes(bytes) => fs::write(target, bytes).await.map_err(io_error(target)),
            UploadContent::Path(path) => fs::copy(path, target)
                .await
                .map(|_| ())
                .map_err(io_error(path)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadMetadata {
    pub title: String,
    pub description: Option<String>,
    pub source_type: SourceType,
    pub embed_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub video: Option<UploadFile>,
    pub thumbnail: Option<UploadFile>,
    pub metadata: UploadMetadata,
    pub owner_id: String,
}

impl UploadRequest {
    fn file_count(&self) -> usize {
        usize::from(self.video.is_some()) + usize::from(self.thumbnail.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub id: String,
    pub slug: String,
    pub short_code: String,
}

impl From<&VideoAsset> for UploadReceipt {
    fn from(video: &VideoAsset) -> Self {
        Self {
            id: video.id.clone(),
            slug: video.slug.clone(),
            short_code: video.short_code.clone(),
        }
    }
}

pub fn guess_video_mime(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "video/x-matroska" => "mkv",
        "video/x-msvideo" => "avi",
        _ => "mp4",
    }
}

/// Accepts uploads, stages files and writes the initial `pending_approval` row.
pub struct UploadIntake {
    settings: SettingsCache,
    videos: SqliteVideoStore,
    engine: MediaEngine,
    storage: Arc<dyn ObjectStore>,
    staging_root: PathBuf,
}

impl UploadIntake {
    pub fn new(
        settings: SettingsCache,
        videos: SqliteVideoStore,
        engine: MediaEngine,
        storage: Arc<dyn ObjectStore>,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            settings,
            videos,
            engine,
            storage,
            staging_root: staging_root.into(),
        }
    }

    pub async fn handle_upload(&self, request: UploadRequest) -> IntakeResult<UploadReceipt> {
        let settings = self.settings.current().await?;
        let count = request.file_count();
        if count > settings.max_files_per_upload {
            return Err(IntakeError::TooManyFiles {
                count,
                max: settings.max_files_per_upload,
            });
        }
        if request.metadata.title.trim().is_empty() {
            return Err(IntakeError::MissingTitle);
        }
        if let Some(thumbnail) = &request.thumbnail {
            check_thumbnail(thumbnail, &settings)?;
        }
        match request.metadata.source_type {
            SourceType::Embed => self.handle_embed(request).await,
            SourceType::Upload => self.handle_file(request, &settings).await,
        }
    }

    async fn handle_embed(&self, request: UploadRequest) -> IntakeResult<UploadReceipt> {
        let embed_url = request
            .metadata
            .embed_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or(IntakeError::MissingEmbedUrl)?;
        let id = Uuid::new_v4().to_string();
        let mut thumbnail_url = request.metadata.thumbnail_url.clone();
        if let Some(thumbnail) = &request.thumbnail {
            let jpeg = to_jpeg(thumbnail.read_bytes().await?, &thumbnail.mime_type)?;
            let key = self
                .storage
                .upload_file(
                    jpeg,
                    &format!("videos/{id}/{}", media::THUMBNAIL_FILE),
                    "image/jpeg",
                )
                .await?;
            thumbnail_url = Some(self.storage.public_url(&key).await?);
        }
        let inserted = self.videos.insert(&NewVideo {
            id: id.clone(),
            slug: generate_slug(&request.metadata.title),
            short_code: generate_short_code(),
            owner_id: request.owner_id.clone(),
            title: request.metadata.title.trim().to_string(),
            description: request.metadata.description.clone(),
            source_type: SourceType::Embed,
            embed_url: Some(embed_url),
            local_path: None,
            duration: 0,
            resolution: media::UNKNOWN_RESOLUTION.to_string(),
            file_size: 0,
            thumbnail_url,
        });
        let video = match inserted {
            Ok(video) => video,
            Err(err) => {
                if request.thumbnail.is_some() {
                    let prefix = format!("videos/{id}");
                    if let Err(cleanup) = self.storage.delete_directory(&prefix).await {
                        warn!(
                            target: "intake",
                            video_id = %id,
                            error = %cleanup,
                            "failed to remove uploaded embed thumbnail"
                        );
                    }
                }
                return Err(err.into());
            }
        };
        info!(target: "intake", video_id = %id, "embed registered");
        Ok(UploadReceipt::from(&video))
    }

    async fn handle_file(
        &self,
        request: UploadRequest,
        settings: &Settings,
    ) -> IntakeResult<UploadReceipt> {
        let video = request.video.as_ref().ok_or(IntakeError::MissingVideoFile)?;
        let max = settings.max_upload_bytes();
        if video.size > max {
            return Err(IntakeError::FileTooLarge {
                size: video.size,
                max,
            });
        }
        let mime = video.mime_type.to_ascii_lowercase();
        if !settings.is_mime_allowed(&mime) {
            return Err(IntakeError::UnsupportedMimeType(video.mime_type.clone()));
        }

        let id = Uuid::new_v4().to_string();
        let staging_dir = self.staging_root.join(&id);
        match self
            .stage(&id, &staging_dir, video, &request, settings)
            .await
        {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                warn!(target: "intake", video_id = %id, error = %err, "upload rejected");
                remove_staging_dir(&staging_dir).await;
                Err(err)
            }
        }
    }

    async fn stage(
        &self,
        id: &str,
        staging_dir: &Path,
        video: &UploadFile,
        request: &UploadRequest,
        settings: &Settings,
    ) -> IntakeResult<UploadReceipt> {
        fs::create_dir_all(staging_dir)
            .await
            .map_err(io_error(staging_dir))?;
        let extension = video.extension();
        let original_file = format!("original.{extension}");
        let original_path = staging_dir.join(&original_file);
        video.write_to(&original_path).await?;

        let metadata = self.engine.extract_metadata(&original_path).await?;
        let outcome = media::validate(&metadata, settings.max_video_duration);
        if !outcome.valid {
            return Err(IntakeError::InvalidVideo(
                outcome.error.unwrap_or_else(|| "invalid video".into()),
            ));
        }

        let mut staged_thumbnail = None;
        if let Some(thumbnail) = &request.thumbnail {
            let jpeg = to_jpeg(thumbnail.read_bytes().await?, &thumbnail.mime_type)?;
            let target = staging_dir.join(STAGED_THUMBNAIL);
            fs::write(&target, jpeg).await.map_err(io_error(&target))?;
            staged_thumbnail = Some(STAGED_THUMBNAIL.to_string());
        }

        StagingManifest {
            original_file,
            original_name: video.file_name.clone(),
            extension,
            mime_type: video.mime_type.to_ascii_lowercase(),
            thumbnail: staged_thumbnail,
        }
        .write(staging_dir)
        .await
        .map_err(io_error(staging_dir))?;

        let asset = self.videos.insert(&NewVideo {
            id: id.to_string(),
            slug: generate_slug(&request.metadata.title),
            short_code: generate_short_code(),
            owner_id: request.owner_id.clone(),
            title: request.metadata.title.trim().to_string(),
            description: request.metadata.description.clone(),
            source_type: SourceType::Upload,
            embed_url: None,
            local_path: Some(original_path.to_string_lossy().into_owned()),
            duration: metadata.duration,
            resolution: metadata.resolution.clone(),
            file_size: video.size as i64,
            thumbnail_url: None,
        })?;
        info!(
            target: "intake",
            video_id = %id,
            duration = metadata.duration,
            resolution = %metadata.resolution,
            bytes = video.size,
            "upload staged"
        );
        Ok(UploadReceipt::from(&asset))
    }
}

fn check_thumbnail(thumbnail: &UploadFile, settings: &Settings) -> IntakeResult<()> {
    if !thumbnail.mime_type.to_ascii_lowercase().starts_with("image/") {
        return Err(IntakeError::InvalidThumbnailType(thumbnail.mime_type.clone()));
    }
    let max = settings.max_upload_bytes();
    if thumbnail.size > max {
        return Err(IntakeError::FileTooLarge {
            size: thumbnail.size,
            max,
        });
    }
    Ok(())
}

/// Re-encodes non-JPEG images as JPEG; JPEG input passes through untouched.
fn to_jpeg(bytes: Vec<u8>, mime_type: &str) -> IntakeResult<Vec<u8>> {
    let mime = mime_type.to_ascii_lowercase();
    if mime == "image/jpeg" || mime == "image/jpg" {
        return Ok(bytes);
    }
    let decoded = image::load_from_memory(&bytes)?;
    let rgb = image::DynamicImage::ImageRgb8(decoded.to_rgb8());
    let mut encoded = Cursor::new(Vec::new());
    rgb.write_to(&mut encoded, ImageOutputFormat::Jpeg(THUMBNAIL_JPEG_QUALITY))?;
    Ok(encoded.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_prefers_file_name_then_mime() {
        let named = UploadFile::from_bytes("Clip.MOV", "video/quicktime", vec![0; 4]);
        assert_eq!(named.extension(), "mov");
        let unnamed = UploadFile::from_bytes("blob", "video/webm", vec![0; 4]);
        assert_eq!(unnamed.extension(), "webm");
    }

    #[test]
    fn png_thumbnails_are_reencoded_as_jpeg() {
        let image = image::RgbImage::from_pixel(4, 4, image::Rgb([200, 10, 10]));
        let mut png = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut png, ImageOutputFormat::Png)
            .unwrap();
        let jpeg = to_jpeg(png.into_inner(), "image/png").unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn failed_embed_insert_removes_uploaded_thumbnail() {
        use crate::config::{LimitsSection, MediaSection};
        use crate::settings::SettingsStore;
        use crate::storage::LocalObjectStore;

        let dir = tempfile::tempdir().unwrap();
        let settings_store = SettingsStore::new(dir.path().join("settings.sqlite")).unwrap();
        settings_store.initialize().unwrap();
        // Schema never created, so the insert fails.
        let videos = SqliteVideoStore::new(dir.path().join("videos.sqlite")).unwrap();
        let objects = dir.path().join("objects");
        let intake = UploadIntake::new(
            SettingsCache::new(settings_store, LimitsSection::default()),
            videos,
            MediaEngine::new(&MediaSection::default(), None),
            Arc::new(LocalObjectStore::new(&objects)),
            dir.path().join("staging"),
        );

        let mut png = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3])))
            .write_to(&mut png, ImageOutputFormat::Png)
            .unwrap();
        let request = UploadRequest {
            video: None,
            thumbnail: Some(UploadFile::from_bytes("poster.png", "image/png", png.into_inner())),
            metadata: UploadMetadata {
                title: "Talk".into(),
                description: None,
                source_type: SourceType::Embed,
                embed_url: Some("https://player.example/watch/7".into()),
                thumbnail_url: None,
            },
            owner_id: "owner".into(),
        };

        let err = intake.handle_upload(request).await.unwrap_err();
        assert!(matches!(err, IntakeError::Video(_)), "{err}");
        let leftovers = walkdir::WalkDir::new(&objects)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn mime_guess_covers_common_containers() {
        assert_eq!(guess_video_mime(Path::new("a.MKV")), "video/x-matroska");
        assert_eq!(guess_video_mime(Path::new("a.mov")), "video/quicktime");
        assert_eq!(guess_video_mime(Path::new("a")), "application/octet-stream");
    }
}
