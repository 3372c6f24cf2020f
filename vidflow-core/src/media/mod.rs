mod error;
mod types;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::fs;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::MediaSection;

pub use error::{MediaError, MediaResult};
pub use types::{
    hls_segment_seconds, validate, TileGrid, ValidationOutcome, VideoMetadata,
    PREVIEW_FPS, PREVIEW_FRAME_COUNT, PREVIEW_WIDTH, STORYBOARD_WIDTH, UNKNOWN_RESOLUTION,
};

pub const THUMBNAIL_FILE: &str = "thumbnail.jpg";
pub const PREVIEW_FILE: &str = "preview.gif";
pub const HLS_PLAYLIST: &str = "master.m3u8";

#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        command.output().await
    }
}

/// Wrapper over `ffprobe`/`ffmpeg`. Holds no per-video state, so every
/// operation can be retried against the same inputs.
#[derive(Clone)]
pub struct MediaEngine {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    command_timeout: Option<Duration>,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for MediaEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaEngine")
            .field("ffmpeg", &self.ffmpeg)
            .field("ffprobe", &self.ffprobe)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl MediaEngine {
    pub fn new(config: &MediaSection, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
            command_timeout: config.command_timeout(),
            executor: executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor)),
        }
    }

    pub fn with_timeout(mut self, value: Option<Duration>) -> Self {
        self.command_timeout = value;
        self
    }

    pub async fn extract_metadata(&self, path: &Path) -> MediaResult<VideoMetadata> {
        let mut command = Command::new(&self.ffprobe);
        command
            .arg("-v")
            .arg("quiet")
            .arg("-of")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(path);
        let output = self.run(command).await?;
        let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)?;
        let metadata = parsed.into_metadata();
        debug!(
            target: "media",
            path = %path.display(),
            duration = metadata.duration,
            resolution = %metadata.resolution,
            "metadata extracted"
        );
        Ok(metadata)
    }

    /// Writes one tiled storyboard JPEG to `out_dir/thumbnail.jpg`.
    pub async fn generate_thumbnail(
        &self,
        path: &Path,
        out_dir: &Path,
        metadata: &VideoMetadata,
    ) -> MediaResult<PathBuf> {
        ensure_dir(out_dir).await?;
        let output_path = out_dir.join(THUMBNAIL_FILE);
        let grid = TileGrid::for_metadata(metadata);
        let mut command = self.ffmpeg_command();
        command
            .arg("-i")
            .arg(path)
            .arg("-vf")
            .arg(grid.filter(metadata.duration))
            .arg("-frames:v")
            .arg("1")
            .arg("-q:v")
            .arg("3")
            .arg(&output_path);
        self.run(command).await?;
        expect_output(&output_path).await?;
        Ok(output_path)
    }

    /// Builds a looping GIF from evenly spaced frames. Intermediate frames
    /// live in a scratch directory under `out_dir` that is removed whether or
    /// not assembly succeeds.
    pub async fn create_preview_gif(
        &self,
        path: &Path,
        out_dir: &Path,
        metadata: &VideoMetadata,
    ) -> MediaResult<PathBuf> {
        ensure_dir(out_dir).await?;
        let frames = tempfile::Builder::new()
            .prefix("preview-frames-")
            .tempdir_in(out_dir)
            .map_err(|source| MediaError::io(out_dir, source))?;
        let output_path = out_dir.join(PREVIEW_FILE);
        let result = self
            .assemble_preview(path, frames.path(), &output_path, metadata)
            .await;
        let frames_path = frames.path().to_path_buf();
        if let Err(err) = frames.close() {
            warn!(
                target: "media",
                path = %frames_path.display(),
                error = %err,
                "failed to remove preview frames"
            );
        }
        result.map(|_| output_path)
    }

    async fn assemble_preview(
        &self,
        path: &Path,
        frames_dir: &Path,
        output_path: &Path,
        metadata: &VideoMetadata,
    ) -> MediaResult<()> {
        let pattern = frames_dir.join("frame_%03d.jpg");
        let mut extract = self.ffmpeg_command();
        extract
            .arg("-i")
            .arg(path)
            .arg("-vf")
            .arg(format!(
                "fps={}/{}",
                PREVIEW_FRAME_COUNT,
                metadata.duration.max(1)
            ))
            .arg("-frames:v")
            .arg(PREVIEW_FRAME_COUNT.to_string())
            .arg("-q:v")
            .arg("4")
            .arg(&pattern);
        self.run(extract).await?;

        let mut assemble = self.ffmpeg_command();
        assemble
            .arg("-framerate")
            .arg(PREVIEW_FPS.to_string())
            .arg("-i")
            .arg(&pattern)
            .arg("-vf")
            .arg(format!("scale={PREVIEW_WIDTH}:-1:flags=lanczos"))
            .arg("-loop")
            .arg("0")
            .arg(output_path);
        self.run(assemble).await?;
        expect_output(output_path).await
    }

    /// Stream-copies the source into a single-rendition HLS package and
    /// returns the playlist path.
    pub async fn transcode_to_hls(
        &self,
        path: &Path,
        out_dir: &Path,
        metadata: &VideoMetadata,
    ) -> MediaResult<PathBuf> {
        ensure_dir(out_dir).await?;
        let playlist = out_dir.join(HLS_PLAYLIST);
        let mut command = self.ffmpeg_command();
        command
            .arg("-i")
            .arg(path)
            .arg("-c")
            .arg("copy")
            .arg("-f")
            .arg("hls")
            .arg("-hls_time")
            .arg(hls_segment_seconds(metadata.duration).to_string())
            .arg("-hls_list_size")
            .arg("0")
            .arg("-hls_segment_filename")
            .arg(out_dir.join("segment_%03d.ts"))
            .arg(&playlist);
        self.run(command).await?;
        expect_output(&playlist).await?;
        Ok(playlist)
    }

    pub async fn remux_to_mp4(&self, input: &Path, output: &Path) -> MediaResult<PathBuf> {
        if let Some(parent) = output.parent() {
            ensure_dir(parent).await?;
        }
        let mut command = self.ffmpeg_command();
        command
            .arg("-i")
            .arg(input)
            .arg("-c")
            .arg("copy")
            .arg("-movflags")
            .arg("+faststart")
            .arg(output);
        self.run(command).await?;
        expect_output(output).await?;
        Ok(output.to_path_buf())
    }

    fn ffmpeg_command(&self) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error");
        command
    }

    async fn run(&self, mut command: Command) -> MediaResult<Output> {
        command.kill_on_drop(true);
        let label = describe(&command);
        debug!(target: "media", command = %label, "running");
        let execution = self.executor.run(&mut command);
        let result = match self.command_timeout {
            Some(limit) => match timeout(limit, execution).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(MediaError::Timeout {
                        command: label,
                        timeout: limit,
                    })
                }
            },
            None => execution.await,
        };
        let output = result.map_err(|source| MediaError::Spawn {
            command: label.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(MediaError::CommandFailure {
                command: label,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

fn describe(command: &Command) -> String {
    let std = command.as_std();
    let mut parts = vec![std.get_program().to_string_lossy().into_owned()];
    parts.extend(std.get_args().map(|arg| arg.to_string_lossy().into_owned()));
    parts.join(" ")
}

async fn ensure_dir(dir: &Path) -> MediaResult<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|source| MediaError::io(dir, source))
}

async fn expect_output(path: &Path) -> MediaResult<()> {
    match fs::metadata(path).await {
        Ok(_) => Ok(()),
        Err(_) => Err(MediaError::MissingOutput(path.to_path_buf())),
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct FfprobeFormat {
    #[serde(default)]
    duration: Option<String>,
}

impl FfprobeOutput {
    fn into_metadata(self) -> VideoMetadata {
        let duration = self
            .format
            .duration
            .as_deref()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .map(|value| value.round() as i64)
            .unwrap_or(0);
        let resolution = self
            .streams
            .iter()
            .find(|stream| stream.codec_type.as_deref() == Some("video"))
            .and_then(|stream| match (stream.width, stream.height) {
                (Some(width), Some(height)) if width > 0 && height > 0 => {
                    Some(format!("{width}x{height}"))
                }
                _ => None,
            })
            .unwrap_or_else(|| UNKNOWN_RESOLUTION.to_string());
        VideoMetadata {
            duration,
            resolution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffprobe_payload_maps_to_metadata() {
        let payload = r#"{
            "streams": [
                {"codec_type": "audio"},
                {"codec_type": "video", "width": 1920, "height": 1080}
            ],
            "format": {"duration": "239.6"}
        }"#;
        let parsed: FfprobeOutput = serde_json::from_str(payload).unwrap();
        let metadata = parsed.into_metadata();
        assert_eq!(metadata.duration, 240);
        assert_eq!(metadata.resolution, "1920x1080");
    }

    #[test]
    fn audio_only_payload_has_unknown_resolution() {
        let payload = r#"{"streams": [{"codec_type": "audio"}], "format": {}}"#;
        let parsed: FfprobeOutput = serde_json::from_str(payload).unwrap();
        let metadata = parsed.into_metadata();
        assert_eq!(metadata.duration, 0);
        assert_eq!(metadata.resolution, UNKNOWN_RESOLUTION);
    }
}
