use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::sqlite::{open_configured, open_flags};

use super::models::{FinalizedMedia, NewVideo, VideoAsset, VideoFilter, VideoStatus};
use super::{VideoError, VideoResult};

const VIDEO_SCHEMA: &str = include_str!("../../../sql/videos.sql");

#[derive(Debug, Clone)]
pub struct SqliteVideoStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteVideoStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteVideoStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> VideoResult<SqliteVideoStore> {
        let path = self.path.ok_or(VideoError::MissingStore)?;
        let flags = open_flags(self.read_only, self.create_if_missing);
        Ok(SqliteVideoStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteVideoStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteVideoStore {
    pub fn builder() -> SqliteVideoStoreBuilder {
        SqliteVideoStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> VideoResult<Self> {
        SqliteVideoStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> VideoResult<Connection> {
        open_configured(&self.path, self.flags).map_err(|source| VideoError::OpenDatabase {
            path: self.path.clone(),
            source,
        })
    }

    pub fn initialize(&self) -> VideoResult<()> {
        let conn = self.open()?;
        conn.execute_batch(VIDEO_SCHEMA)?;
        Ok(())
    }

    pub fn insert(&self, video: &NewVideo) -> VideoResult<VideoAsset> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO videos (
                id, slug, short_code, owner_id, title, description, source_type, embed_url,
                local_path, duration, resolution, file_size, thumbnail_url, status
            ) VALUES (
                :id, :slug, :short_code, :owner_id, :title, :description, :source_type, :embed_url,
                :local_path, :duration, :resolution, :file_size, :thumbnail_url, :status
            )",
            rusqlite::named_params! {
                ":id": &video.id,
                ":slug": &video.slug,
                ":short_code": &video.short_code,
                ":owner_id": &video.owner_id,
                ":title": &video.title,
                ":description": &video.description,
                ":source_type": video.source_type.as_str(),
                ":embed_url": &video.embed_url,
                ":local_path": &video.local_path,
                ":duration": video.duration,
                ":resolution": &video.resolution,
                ":file_size": video.file_size,
                ":thumbnail_url": &video.thumbnail_url,
                ":status": VideoStatus::PendingApproval.as_str(),
            },
        )?;
        debug!(target: "video.store", video_id = %video.id, slug = %video.slug, "video inserted");
        self.fetch_by_id(&video.id)?.ok_or_else(|| VideoError::NotFound {
            id: video.id.clone(),
        })
    }

    pub fn fetch_by_id(&self, id: &str) -> VideoResult<Option<VideoAsset>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM videos WHERE id = ?1")?;
        let video = stmt.query_row([id], VideoAsset::from_row).optional()?;
        Ok(video)
    }

    pub fn list(&self, filter: &VideoFilter) -> VideoResult<Vec<VideoAsset>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM videos");
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(owner) = &filter.owner_id {
            clauses.push("owner_id = ?");
            values.push(Value::Text(owner.clone()));
        }
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY created_at DESC, id ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), VideoAsset::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_by_status(&self) -> VideoResult<HashMap<VideoStatus, usize>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM videos GROUP BY status")?;
        let mut map = HashMap::new();
        for row in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })? {
            let (status, count) = row?;
            map.insert(status.parse::<VideoStatus>()?, count as usize);
        }
        Ok(map)
    }

    /// Moves `id` to `next` if the lifecycle allows it and returns the
    /// previous status. The read and write share one immediate transaction.
    pub fn transition(&self, id: &str, next: VideoStatus) -> VideoResult<VideoStatus> {
        self.transition_checked(id, None, next)
    }

    /// Like `transition`, but also requires the current status to be `from`.
    pub fn transition_from(
        &self,
        id: &str,
        from: VideoStatus,
        next: VideoStatus,
    ) -> VideoResult<VideoStatus> {
        self.transition_checked(id, Some(from), next)
    }

    fn transition_checked(
        &self,
        id: &str,
        from: Option<VideoStatus>,
        next: VideoStatus,
    ) -> VideoResult<VideoStatus> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = current_status(&tx, id)?;
        let expected = from.map_or(true, |from| from == current);
        if !expected || !current.can_transition_to(next) {
            return Err(VideoError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: next,
            });
        }
        tx.execute(
            "UPDATE videos
             SET status = ?2,
                 published_at = CASE WHEN ?2 = 'approved'
                     THEN COALESCE(published_at, ?3) ELSE published_at END,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            params![id, next.as_str(), Utc::now().naive_utc()],
        )?;
        tx.commit()?;
        debug!(target: "video.store", video_id = %id, from = %current, to = %next, "status changed");
        Ok(current)
    }

    pub fn mark_processing(&self, id: &str) -> VideoResult<VideoStatus> {
        self.transition_from(id, VideoStatus::PendingProcessing, VideoStatus::Processing)
    }

    /// Restarts processing for a job recovered from an expired lease. The
    /// asset may already be `processing` from the abandoned attempt.
    pub fn resume_processing(&self, id: &str) -> VideoResult<VideoStatus> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = current_status(&tx, id)?;
        if !matches!(
            current,
            VideoStatus::PendingProcessing | VideoStatus::Processing
        ) {
            return Err(VideoError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: VideoStatus::Processing,
            });
        }
        tx.execute(
            "UPDATE videos SET status = 'processing', updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            [id],
        )?;
        tx.commit()?;
        debug!(target: "video.store", video_id = %id, from = %current, "processing resumed");
        Ok(current)
    }

    /// Records the rejection and forgets the staged path; every caller
    /// removes the staging directory right after.
    pub fn reject(&self, id: &str, reason: &str) -> VideoResult<VideoStatus> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = current_status(&tx, id)?;
        if !current.can_transition_to(VideoStatus::Rejected) {
            return Err(VideoError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: VideoStatus::Rejected,
            });
        }
        tx.execute(
            "UPDATE videos
             SET status = 'rejected',
                 rejection_reason = ?2,
                 local_path = NULL,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            params![id, reason],
        )?;
        tx.commit()?;
        Ok(current)
    }

    /// Publishes a processed asset. The staged path is cleared since the
    /// staging directory is removed right after.
    pub fn finalize(&self, id: &str, media: &FinalizedMedia) -> VideoResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = current_status(&tx, id)?;
        if !current.can_transition_to(VideoStatus::Approved) {
            return Err(VideoError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: VideoStatus::Approved,
            });
        }
        tx.execute(
            "UPDATE videos
             SET status = 'approved',
                 video_url = ?2,
                 video_key = ?3,
                 thumbnail_url = ?4,
                 storyboard_url = ?5,
                 duration = ?6,
                 resolution = ?7,
                 local_path = NULL,
                 published_at = ?8,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            params![
                id,
                &media.video_url,
                &media.video_key,
                &media.thumbnail_url,
                &media.storyboard_url,
                media.duration,
                &media.resolution,
                Utc::now().naive_utc(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Deletes the row only while it is still in `expected`. Returns `false`
    /// when the status moved underneath the caller.
    pub fn delete_in_status(&self, id: &str, expected: VideoStatus) -> VideoResult<bool> {
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM videos WHERE id = ?1 AND status = ?2",
            params![id, expected.as_str()],
        )?;
        Ok(affected > 0)
    }
}

fn current_status(conn: &Connection, id: &str) -> VideoResult<VideoStatus> {
    let status: Option<String> = conn
        .query_row("SELECT status FROM videos WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?;
    match status {
        Some(value) => value.parse(),
        None => Err(VideoError::NotFound { id: id.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::models::SourceType;
    use tempfile::tempdir;

    fn sample(id: &str) -> NewVideo {
        NewVideo {
            id: id.to_string(),
            slug: format!("clip-{id}"),
            short_code: format!("{id:0>8}"),
            owner_id: "owner-1".into(),
            title: "Clip".into(),
            description: None,
            source_type: SourceType::Upload,
            embed_url: None,
            local_path: Some(format!("/staging/{id}/original.mp4")),
            duration: 42,
            resolution: "1920x1080".into(),
            file_size: 1024,
            thumbnail_url: None,
        }
    }

    fn store() -> (tempfile::TempDir, SqliteVideoStore) {
        let dir = tempdir().unwrap();
        let store = SqliteVideoStore::new(dir.path().join("videos.sqlite")).unwrap();
        store.initialize().unwrap();
        (dir, store)
    }

    #[test]
    fn insert_starts_pending_approval() {
        let (_dir, store) = store();
        let video = store.insert(&sample("a1")).unwrap();
        assert_eq!(video.status, VideoStatus::PendingApproval);
        assert_eq!(video.duration, 42);
        assert!(video.created_at.is_some());
        assert!(video.published_at.is_none());
    }

    #[test]
    fn illegal_transition_is_refused() {
        let (_dir, store) = store();
        store.insert(&sample("a1")).unwrap();
        let err = store.transition("a1", VideoStatus::Hidden).unwrap_err();
        assert!(matches!(
            err,
            VideoError::InvalidTransition {
                from: VideoStatus::PendingApproval,
                to: VideoStatus::Hidden,
                ..
            }
        ));
    }

    #[test]
    fn finalize_sets_media_fields_and_clears_staging() {
        let (_dir, store) = store();
        store.insert(&sample("a1")).unwrap();
        store
            .transition("a1", VideoStatus::PendingProcessing)
            .unwrap();
        store.mark_processing("a1").unwrap();
        store
            .finalize(
                "a1",
                &FinalizedMedia {
                    video_url: "https://cdn/videos/a1/video.mp4".into(),
                    video_key: "videos/a1".into(),
                    thumbnail_url: "https://cdn/videos/a1/thumbnail.jpg".into(),
                    storyboard_url: "https://cdn/videos/a1/preview.gif".into(),
                    duration: 43,
                    resolution: "1280x720".into(),
                },
            )
            .unwrap();
        let video = store.fetch_by_id("a1").unwrap().unwrap();
        assert_eq!(video.status, VideoStatus::Approved);
        assert_eq!(video.video_key.as_deref(), Some("videos/a1"));
        assert_eq!(video.duration, 43);
        assert!(video.local_path.is_none());
        assert!(video.published_at.is_some());
    }

    #[test]
    fn only_resumed_jobs_reenter_processing() {
        let (_dir, store) = store();
        store.insert(&sample("a1")).unwrap();
        assert!(store.mark_processing("a1").is_err());
        store
            .transition("a1", VideoStatus::PendingProcessing)
            .unwrap();
        store.mark_processing("a1").unwrap();
        assert!(matches!(
            store.mark_processing("a1"),
            Err(VideoError::InvalidTransition {
                from: VideoStatus::Processing,
                ..
            })
        ));
        assert_eq!(
            store.resume_processing("a1").unwrap(),
            VideoStatus::Processing
        );
        store.reject("a1", "Processing error").unwrap();
        assert!(store.resume_processing("a1").is_err());
    }

    #[test]
    fn reject_records_reason() {
        let (_dir, store) = store();
        store.insert(&sample("a1")).unwrap();
        store.reject("a1", "spam").unwrap();
        let video = store.fetch_by_id("a1").unwrap().unwrap();
        assert_eq!(video.status, VideoStatus::Rejected);
        assert_eq!(video.rejection_reason.as_deref(), Some("spam"));
        assert!(video.local_path.is_none());
    }

    #[test]
    fn list_filters_by_status() {
        let (_dir, store) = store();
        store.insert(&sample("a1")).unwrap();
        store.insert(&sample("a2")).unwrap();
        store.reject("a2", "dup").unwrap();
        let filter = VideoFilter {
            status: Some(VideoStatus::Rejected),
            ..Default::default()
        };
        let rows = store.list(&filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "a2");
        let counts = store.count_by_status().unwrap();
        assert_eq!(counts.get(&VideoStatus::PendingApproval), Some(&1));
    }

    #[test]
    fn delete_respects_expected_status() {
        let (_dir, store) = store();
        store.insert(&sample("a1")).unwrap();
        assert!(!store.delete_in_status("a1", VideoStatus::Approved).unwrap());
        assert!(store
            .delete_in_status("a1", VideoStatus::PendingApproval)
            .unwrap());
        assert!(store.fetch_by_id("a1").unwrap().is_none());
        assert!(matches!(
            store.transition("a1", VideoStatus::Approved),
            Err(VideoError::NotFound { .. })
        ));
    }
}
