use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use super::VideoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    PendingApproval,
    PendingProcessing,
    Processing,
    Approved,
    Rejected,
    Hidden,
}

impl VideoStatus {
    pub const ALL: [VideoStatus; 6] = [
        VideoStatus::PendingApproval,
        VideoStatus::PendingProcessing,
        VideoStatus::Processing,
        VideoStatus::Approved,
        VideoStatus::Rejected,
        VideoStatus::Hidden,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::PendingApproval => "pending_approval",
            VideoStatus::PendingProcessing => "pending_processing",
            VideoStatus::Processing => "processing",
            VideoStatus::Approved => "approved",
            VideoStatus::Rejected => "rejected",
            VideoStatus::Hidden => "hidden",
        }
    }

    /// Legal edges of the lifecycle graph. Re-entering `processing` after an
    /// expired job lease goes through `SqliteVideoStore::resume_processing`.
    pub fn can_transition_to(&self, next: VideoStatus) -> bool {
        use VideoStatus::*;
        matches!(
            (self, next),
            (PendingApproval, PendingProcessing)
                | (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (PendingProcessing, Processing)
                | (PendingProcessing, Rejected)
                | (Processing, Approved)
                | (Processing, Rejected)
                | (Approved, Hidden)
                | (Hidden, Approved)
        )
    }

    /// Statuses where an upload still owns its staging directory.
    pub fn is_pre_processing(&self) -> bool {
        matches!(
            self,
            VideoStatus::PendingApproval | VideoStatus::PendingProcessing
        )
    }

    pub fn is_published(&self) -> bool {
        matches!(self, VideoStatus::Approved | VideoStatus::Hidden)
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoStatus {
    type Err = VideoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_approval" => Ok(VideoStatus::PendingApproval),
            "pending_processing" => Ok(VideoStatus::PendingProcessing),
            "processing" => Ok(VideoStatus::Processing),
            "approved" => Ok(VideoStatus::Approved),
            "rejected" => Ok(VideoStatus::Rejected),
            "hidden" => Ok(VideoStatus::Hidden),
            other => Err(VideoError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Upload,
    Embed,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Upload => "upload",
            SourceType::Embed => "embed",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = VideoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(SourceType::Upload),
            "embed" => Ok(SourceType::Embed),
            other => Err(VideoError::InvalidSourceType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoAsset {
    pub id: String,
    pub slug: String,
    pub short_code: String,
    pub owner_id: String,
    pub title: String,
    pub description: Option<String>,
    pub source_type: SourceType,
    pub embed_url: Option<String>,
    pub local_path: Option<String>,
    pub duration: i64,
    pub resolution: String,
    pub file_size: i64,
    pub video_url: Option<String>,
    pub video_key: Option<String>,
    pub thumbnail_url: Option<String>,
    pub storyboard_url: Option<String>,
    pub status: VideoStatus,
    pub rejection_reason: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
}

impl VideoAsset {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        let source_type: String = row.get("source_type")?;
        Ok(Self {
            id: row.get("id")?,
            slug: row.get("slug")?,
            short_code: row.get("short_code")?,
            owner_id: row.get("owner_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            source_type: source_type.parse().map_err(conversion_error)?,
            embed_url: row.get("embed_url")?,
            local_path: row.get("local_path")?,
            duration: row.get::<_, Option<i64>>("duration")?.unwrap_or(0),
            resolution: row
                .get::<_, Option<String>>("resolution")?
                .unwrap_or_else(|| "unknown".to_string()),
            file_size: row.get::<_, Option<i64>>("file_size")?.unwrap_or(0),
            video_url: row.get("video_url")?,
            video_key: row.get("video_key")?,
            thumbnail_url: row.get("thumbnail_url")?,
            storyboard_url: row.get("storyboard_url")?,
            status: status.parse().map_err(conversion_error)?,
            rejection_reason: row.get("rejection_reason")?,
            created_at: parse_timestamp(row.get("created_at")?),
            updated_at: parse_timestamp(row.get("updated_at")?),
            published_at: parse_timestamp(row.get("published_at")?),
        })
    }

    /// Object-storage prefix owned by this asset.
    pub fn object_prefix(&self) -> String {
        format!("videos/{}", self.id)
    }
}

fn conversion_error(err: VideoError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| Utc.from_utc_datetime(&dt))
}

/// Row written by intake.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVideo {
    pub id: String,
    pub slug: String,
    pub short_code: String,
    pub owner_id: String,
    pub title: String,
    pub description: Option<String>,
    pub source_type: SourceType,
    pub embed_url: Option<String>,
    pub local_path: Option<String>,
    pub duration: i64,
    pub resolution: String,
    pub file_size: i64,
    pub thumbnail_url: Option<String>,
}

/// Media fields written when processing succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedMedia {
    pub video_url: String,
    pub video_key: String,
    pub thumbnail_url: String,
    pub storyboard_url: String,
    pub duration: i64,
    pub resolution: String,
}

#[derive(Debug, Clone, Default)]
pub struct VideoFilter {
    pub status: Option<VideoStatus>,
    pub owner_id: Option<String>,
    pub limit: Option<usize>,
}

pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("video");
    }
    slug
}

/// `slugify(title)` plus a random six character suffix.
pub fn generate_slug(title: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    format!("{}-{}", slugify(title), suffix)
}

pub fn generate_short_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_is_terminal() {
        for next in VideoStatus::ALL {
            assert!(!VideoStatus::Rejected.can_transition_to(next));
        }
    }

    #[test]
    fn hide_and_unhide_only_from_published_states() {
        assert!(VideoStatus::Approved.can_transition_to(VideoStatus::Hidden));
        assert!(VideoStatus::Hidden.can_transition_to(VideoStatus::Approved));
        assert!(!VideoStatus::PendingApproval.can_transition_to(VideoStatus::Hidden));
        assert!(!VideoStatus::Processing.can_transition_to(VideoStatus::Hidden));
    }

    #[test]
    fn processing_only_follows_pending_processing() {
        assert!(VideoStatus::PendingProcessing.can_transition_to(VideoStatus::Processing));
        assert!(!VideoStatus::PendingApproval.can_transition_to(VideoStatus::Processing));
        assert!(!VideoStatus::Approved.can_transition_to(VideoStatus::Processing));
        assert!(!VideoStatus::Processing.can_transition_to(VideoStatus::Processing));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in VideoStatus::ALL {
            assert_eq!(status.as_str().parse::<VideoStatus>().unwrap(), status);
        }
        assert!("published".parse::<VideoStatus>().is_err());
    }

    #[test]
    fn slugs_collapse_punctuation() {
        assert_eq!(slugify("  Hello, World!! 2024 "), "hello-world-2024");
        assert_eq!(slugify("???"), "video");
        let slug = generate_slug("My Trip");
        assert!(slug.starts_with("my-trip-"));
        assert_eq!(slug.len(), "my-trip-".len() + 6);
    }

    #[test]
    fn short_codes_are_eight_alphanumerics() {
        let code = generate_short_code();
        assert_eq!(code.len(), 8);
        assert!(code.chars().all(|ch| ch.is_ascii_alphanumeric()));
    }
}
