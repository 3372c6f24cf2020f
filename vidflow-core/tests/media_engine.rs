mod common;

use std::sync::Arc;
use std::time::Duration;

use common::RecordingExecutor;
use vidflow_core::config::MediaSection;
use vidflow_core::media::{MediaEngine, MediaError, VideoMetadata, PREVIEW_FILE, THUMBNAIL_FILE};

fn engine(executor: &RecordingExecutor) -> MediaEngine {
    MediaEngine::new(&MediaSection::default(), Some(Arc::new(executor.clone())))
}

#[tokio::test]
async fn probe_reads_duration_and_resolution() {
    let executor = RecordingExecutor::new("61.7", 1080, 1920);
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("original.mp4");
    std::fs::write(&input, b"video").unwrap();

    let metadata = engine(&executor).extract_metadata(&input).await.unwrap();
    assert_eq!(metadata, VideoMetadata::new(62, "1080x1920"));
    let call = &executor.calls()[0];
    assert!(call.contains(&"-show_streams".to_string()));
    assert_eq!(call.last().unwrap(), &input.display().to_string());
}

#[tokio::test]
async fn portrait_thumbnail_uses_single_row_of_tiles() {
    let executor = RecordingExecutor::new("120", 1080, 1920);
    let dir = tempfile::tempdir().unwrap();
    let metadata = VideoMetadata::new(120, "1080x1920");

    let thumbnail = engine(&executor)
        .generate_thumbnail(&dir.path().join("in.mp4"), dir.path(), &metadata)
        .await
        .unwrap();
    assert_eq!(thumbnail, dir.path().join(THUMBNAIL_FILE));
    let filter = executor.arg_after("-vf").unwrap();
    assert!(filter.ends_with("tile=4x1"), "{filter}");
    assert_eq!(executor.arg_after("-frames:v").as_deref(), Some("1"));
}

#[tokio::test]
async fn hls_segment_length_follows_duration() {
    let executor = RecordingExecutor::new("240", 1920, 1080);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("hls");
    let metadata = VideoMetadata::new(240, "1920x1080");

    let playlist = engine(&executor)
        .transcode_to_hls(&dir.path().join("in.mp4"), &out, &metadata)
        .await
        .unwrap();
    assert_eq!(playlist, out.join("master.m3u8"));
    assert_eq!(executor.arg_after("-hls_time").as_deref(), Some("10"));
    assert_eq!(executor.arg_after("-c").as_deref(), Some("copy"));
    assert!(out.join("segment_000.ts").exists());
}

#[tokio::test]
async fn preview_frames_do_not_outlive_the_gif() {
    let executor = RecordingExecutor::new("90", 1920, 1080);
    let dir = tempfile::tempdir().unwrap();
    let metadata = VideoMetadata::new(90, "1920x1080");

    let gif = engine(&executor)
        .create_preview_gif(&dir.path().join("in.mp4"), dir.path(), &metadata)
        .await
        .unwrap();
    assert_eq!(gif, dir.path().join(PREVIEW_FILE));
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, vec![PREVIEW_FILE.to_string()]);
    assert_eq!(executor.ffmpeg_calls().len(), 2);
    assert_eq!(executor.arg_after("-framerate").as_deref(), Some("4"));
}

#[tokio::test]
async fn preview_frames_are_removed_when_assembly_fails() {
    let executor = RecordingExecutor::new("90", 1920, 1080);
    executor.fail_on("-loop");
    let dir = tempfile::tempdir().unwrap();
    let metadata = VideoMetadata::new(90, "1920x1080");

    let err = engine(&executor)
        .create_preview_gif(&dir.path().join("in.mp4"), dir.path(), &metadata)
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::CommandFailure { .. }), "{err}");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn slow_commands_hit_the_timeout() {
    let executor = RecordingExecutor::new("10", 640, 360);
    executor.delay(Duration::from_millis(500));
    let dir = tempfile::tempdir().unwrap();

    let err = engine(&executor)
        .with_timeout(Some(Duration::from_millis(20)))
        .extract_metadata(&dir.path().join("in.mp4"))
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::Timeout { .. }), "{err}");
}
