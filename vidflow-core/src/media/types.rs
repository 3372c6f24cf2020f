use serde::{Deserialize, Serialize};

pub const UNKNOWN_RESOLUTION: &str = "unknown";

/// Storyboard strip width in pixels, split evenly across grid columns.
pub const STORYBOARD_WIDTH: u32 = 1280;
pub const PREVIEW_FRAME_COUNT: u32 = 20;
pub const PREVIEW_FPS: u32 = 4;
pub const PREVIEW_WIDTH: u32 = 480;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    /// Whole seconds, rounded to nearest.
    pub duration: i64,
    /// `WxH` of the first video stream, or `unknown`.
    pub resolution: String,
}

impl VideoMetadata {
    pub fn new(duration: i64, resolution: impl Into<String>) -> Self {
        Self {
            duration,
            resolution: resolution.into(),
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let (width, height) = self.resolution.split_once('x')?;
        Some((width.parse().ok()?, height.parse().ok()?))
    }

    pub fn is_portrait(&self) -> bool {
        matches!(self.dimensions(), Some((width, height)) if height > width)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub error: Option<String>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(message.into()),
        }
    }
}

/// Checks probed metadata against the duration ceiling (seconds).
pub fn validate(metadata: &VideoMetadata, max_duration_seconds: i64) -> ValidationOutcome {
    if metadata.resolution == UNKNOWN_RESOLUTION {
        return ValidationOutcome::invalid("Could not determine video resolution");
    }
    if metadata.duration <= 0 {
        return ValidationOutcome::invalid("Could not determine video duration");
    }
    if metadata.duration > max_duration_seconds {
        return ValidationOutcome::invalid(format!(
            "Video exceeds the maximum duration of {} minutes",
            max_duration_seconds / 60
        ));
    }
    ValidationOutcome::ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub columns: u32,
    pub rows: u32,
}

impl TileGrid {
    pub fn for_metadata(metadata: &VideoMetadata) -> Self {
        if metadata.is_portrait() {
            Self {
                columns: 4,
                rows: 1,
            }
        } else {
            Self {
                columns: 2,
                rows: 2,
            }
        }
    }

    pub fn tiles(&self) -> u32 {
        self.columns * self.rows
    }

    pub fn frame_width(&self) -> u32 {
        STORYBOARD_WIDTH / self.columns
    }

    /// Seconds between sampled frames: `max(1, ceil(duration / tiles))`.
    pub fn sample_interval(&self, duration: i64) -> i64 {
        let tiles = i64::from(self.tiles());
        let duration = duration.max(0);
        ((duration + tiles - 1) / tiles).max(1)
    }

    pub fn filter(&self, duration: i64) -> String {
        format!(
            "fps=1/{},scale={}:-1,tile={}x{}",
            self.sample_interval(duration),
            self.frame_width(),
            self.columns,
            self.rows
        )
    }
}

/// HLS segment length in seconds for a video of `duration` seconds.
pub fn hls_segment_seconds(duration: i64) -> u32 {
    match duration {
        d if d >= 600 => 20,
        d if d >= 420 => 15,
        d if d >= 240 => 10,
        _ => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_boundaries() {
        let max = 3600;
        assert!(validate(&VideoMetadata::new(3600, "1920x1080"), max).valid);
        assert!(validate(&VideoMetadata::new(1, "1920x1080"), max).valid);
        assert!(!validate(&VideoMetadata::new(0, "1920x1080"), max).valid);
        assert!(!validate(&VideoMetadata::new(-3, "1920x1080"), max).valid);
        assert!(!validate(&VideoMetadata::new(60, UNKNOWN_RESOLUTION), max).valid);

        let over = validate(&VideoMetadata::new(3601, "1920x1080"), max);
        assert!(!over.valid);
        assert!(over.error.unwrap().contains("60 minutes"));
    }

    #[test]
    fn over_limit_message_floors_minutes() {
        let outcome = validate(&VideoMetadata::new(200, "640x360"), 150);
        assert!(outcome.error.unwrap().contains("2 minutes"));
    }

    #[test]
    fn grid_follows_orientation() {
        let portrait = TileGrid::for_metadata(&VideoMetadata::new(60, "1080x1920"));
        assert_eq!((portrait.columns, portrait.rows), (4, 1));
        assert_eq!(portrait.frame_width(), 320);

        let landscape = TileGrid::for_metadata(&VideoMetadata::new(60, "1920x1080"));
        assert_eq!((landscape.columns, landscape.rows), (2, 2));
        assert_eq!(landscape.frame_width(), 640);

        let square = TileGrid::for_metadata(&VideoMetadata::new(60, "720x720"));
        assert_eq!(square.columns, 2);
    }

    #[test]
    fn sample_interval_rounds_up_and_never_hits_zero() {
        let grid = TileGrid {
            columns: 2,
            rows: 2,
        };
        assert_eq!(grid.sample_interval(240), 60);
        assert_eq!(grid.sample_interval(241), 61);
        assert_eq!(grid.sample_interval(2), 1);
        assert_eq!(grid.filter(240), "fps=1/60,scale=640:-1,tile=2x2");
    }

    #[test]
    fn segment_length_tiers() {
        assert_eq!(hls_segment_seconds(1000), 20);
        assert_eq!(hls_segment_seconds(600), 20);
        assert_eq!(hls_segment_seconds(500), 15);
        assert_eq!(hls_segment_seconds(420), 15);
        assert_eq!(hls_segment_seconds(300), 10);
        assert_eq!(hls_segment_seconds(240), 10);
        assert_eq!(hls_segment_seconds(100), 5);
    }

    #[test]
    fn dimensions_parse_only_wxh() {
        assert_eq!(
            VideoMetadata::new(1, "1280x720").dimensions(),
            Some((1280, 720))
        );
        assert_eq!(VideoMetadata::new(1, UNKNOWN_RESOLUTION).dimensions(), None);
    }
}
