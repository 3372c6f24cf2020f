use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::sqlite::{open_configured, open_flags};

const JOBS_SCHEMA: &str = include_str!("../../sql/jobs.sql");

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to open job database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on job database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("job queue path not configured")]
    MissingStore,
    #[error("invalid job status: {0}")]
    InvalidStatus(String),
    #[error("job not found: {0}")]
    NotFound(i64),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Active,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingJob {
    pub id: i64,
    pub video_id: String,
    pub status: JobStatus,
    pub attempts: i64,
    pub worker: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl ProcessingJob {
    /// A job claimed more than once was recovered from an expired lease.
    pub fn is_redelivery(&self) -> bool {
        self.attempts > 1
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            video_id: row.get("video_id")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(JobStatus::Queued),
            attempts: row.get::<_, Option<i64>>("attempts")?.unwrap_or(0),
            worker: row.get("worker")?,
            created_at: parse_timestamp(row.get("created_at")?),
            started_at: parse_timestamp(row.get("started_at")?),
            lease_expires_at: parse_timestamp(row.get("lease_expires_at")?),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: i64,
    pub active: i64,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct JobQueueBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for JobQueueBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl JobQueueBuilder {
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

    pub fn build(self) -> QueueResult<JobQueue> {
        let path = self.path.ok_or(QueueError::MissingStore)?;
        let flags = open_flags(self.read_only, self.create_if_missing);
        Ok(JobQueue { path, flags })
    }
}

/// Durable FIFO of processing jobs. A job row exists only while it is
/// queued or active; completion deletes it.
#[derive(Debug, Clone)]
pub struct JobQueue {
    path: PathBuf,
    flags: OpenFlags,
}

impl JobQueue {
    pub fn builder() -> JobQueueBuilder {
        JobQueueBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> QueueResult<Self> {
        JobQueueBuilder::new().path(path).build()
    }

    fn open(&self) -> QueueResult<Connection> {
        open_configured(&self.path, self.flags).map_err(|source| QueueError::Open {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> QueueResult<()> {
        let conn = self.open()?;
        conn.execute_batch(JOBS_SCHEMA)?;
        Ok(())
    }

    /// Returns the new job id, or `None` when the video already has a queued
    /// or active job.
    pub fn enqueue(&self, video_id: &str) -> QueueResult<Option<i64>> {
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT INTO processing_jobs (video_id, status) VALUES (?1, 'queued')
             ON CONFLICT(video_id) DO NOTHING",
            [video_id],
        )?;
        if inserted == 0 {
            debug!(target: "queue", video_id, "job already present");
            return Ok(None);
        }
        let id = conn.last_insert_rowid();
        info!(target: "queue", video_id, job_id = id, "job enqueued");
        Ok(Some(id))
    }

    /// Claims the oldest queued job for `worker`, leased until `lease` from now.
    pub fn claim_next(&self, worker: &str, lease: Duration) -> QueueResult<Option<ProcessingJob>> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job = tx
            .query_row(
                "SELECT * FROM processing_jobs WHERE status = 'queued' ORDER BY id ASC LIMIT 1",
                [],
                ProcessingJob::from_row,
            )
            .optional()?;
        let Some(mut job) = job else {
            tx.commit()?;
            return Ok(None);
        };
        let now = Utc::now();
        let expires = lease_deadline(now, lease);
        tx.execute(
            "UPDATE processing_jobs
             SET status = 'active', attempts = attempts + 1, worker = ?2, started_at = ?3,
                 lease_expires_at = ?4
             WHERE id = ?1",
            params![job.id, worker, now.naive_utc(), expires.naive_utc()],
        )?;
        tx.commit()?;
        job.status = JobStatus::Active;
        job.attempts += 1;
        job.worker = Some(worker.to_string());
        job.started_at = Some(now);
        job.lease_expires_at = Some(expires);
        Ok(Some(job))
    }

    /// Extends the lease on an active job still held by `worker`. `false`
    /// means the job is gone or was recovered by someone else.
    pub fn renew_lease(&self, job_id: i64, worker: &str, lease: Duration) -> QueueResult<bool> {
        let conn = self.open()?;
        let expires = lease_deadline(Utc::now(), lease);
        let affected = conn.execute(
            "UPDATE processing_jobs SET lease_expires_at = ?3
             WHERE id = ?1 AND worker = ?2 AND status = 'active'",
            params![job_id, worker, expires.naive_utc()],
        )?;
        Ok(affected > 0)
    }

    pub fn complete(&self, job_id: i64) -> QueueResult<()> {
        let conn = self.open()?;
        let affected = conn.execute("DELETE FROM processing_jobs WHERE id = ?1", [job_id])?;
        if affected == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    /// Drops a still-queued job for `video_id`. Active jobs are left alone.
    pub fn remove_queued(&self, video_id: &str) -> QueueResult<bool> {
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM processing_jobs WHERE video_id = ?1 AND status = 'queued'",
            [video_id],
        )?;
        Ok(affected > 0)
    }

    /// Returns jobs whose lease has run out to the queue. Jobs held by a
    /// live worker keep renewing and are left alone.
    pub fn recover_stale(&self) -> QueueResult<usize> {
        self.recover_expired(Utc::now())
    }

    pub fn recover_expired(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE processing_jobs
             SET status = 'queued', worker = NULL, started_at = NULL, lease_expires_at = NULL
             WHERE status = 'active'
               AND (lease_expires_at IS NULL OR lease_expires_at < ?1)",
            [now.naive_utc()],
        )?;
        if affected > 0 {
            info!(target: "queue", recovered = affected, "requeued jobs with expired leases");
        }
        Ok(affected)
    }

    pub fn find_by_video(&self, video_id: &str) -> QueueResult<Option<ProcessingJob>> {
        let conn = self.open()?;
        let job = conn
            .query_row(
                "SELECT * FROM processing_jobs WHERE video_id = ?1",
                [video_id],
                ProcessingJob::from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn list(&self, filter: &JobFilter) -> QueueResult<Vec<ProcessingJob>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM processing_jobs");
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            query.push_str(" WHERE status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        query.push_str(" ORDER BY id ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let jobs = stmt
            .query_map(
                rusqlite::params_from_iter(values.iter()),
                ProcessingJob::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn counts(&self) -> QueueResult<QueueCounts> {
        let conn = self.open()?;
        let mut counts = QueueCounts::default();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM processing_jobs GROUP BY status")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            match status.parse::<JobStatus>()? {
                JobStatus::Queued => counts.queued = count,
                JobStatus::Active => counts.active = count,
            }
        }
        Ok(counts)
    }
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(now)
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}
