use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use vidflow_core::intake::guess_video_mime;
use vidflow_core::queue::JobFilter;
use vidflow_core::settings::KEY_R2_SECRET_ACCESS_KEY;
use vidflow_core::{
    load_vidflow_config, ProcessingJob, ProcessingOutcome, QueueCounts, SourceType, UploadFile,
    UploadMetadata, UploadReceipt, UploadRequest, VideoAsset, VideoFilter, VideoStatus, Vidflow,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] vidflow_core::ConfigError),
    #[error("startup failed: {0}")]
    Runtime(#[from] vidflow_core::RuntimeError),
    #[error("upload refused: {0}")]
    Intake(#[from] vidflow_core::IntakeError),
    #[error("{0}")]
    Lifecycle(#[from] vidflow_core::LifecycleError),
    #[error("{0}")]
    Video(#[from] vidflow_core::VideoError),
    #[error("queue error: {0}")]
    Queue(#[from] vidflow_core::QueueError),
    #[error("{0}")]
    Orchestrator(#[from] vidflow_core::OrchestratorError),
    #[error("settings error: {0}")]
    Settings(#[from] vidflow_core::SettingsError),
    #[error("storage error: {0}")]
    Storage(#[from] vidflow_core::StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("video {0} not found")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Vidflow ingestion pipeline control", long_about = None)]
pub struct Cli {
    /// Path to vidflow.toml
    #[arg(long, default_value = "configs/vidflow.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Asset and queue totals
    Status,
    /// Stage a video file or register an embed
    Upload(UploadArgs),
    /// Approve an asset for processing (uploads) or publication (embeds)
    Approve(IdArgs),
    /// Reject an asset with a reason
    Reject(RejectArgs),
    /// Hide a published asset
    Hide(IdArgs),
    /// Re-publish a hidden asset
    Unhide(IdArgs),
    /// Delete an asset and whatever it still owns
    Delete(IdArgs),
    /// List assets
    List(ListArgs),
    /// Show one asset
    Show(IdArgs),
    /// Processing queue inspection
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Processing worker
    #[command(subcommand)]
    Worker(WorkerCommands),
    /// Object storage checks
    #[command(subcommand)]
    Storage(StorageCommands),
    /// Runtime settings
    #[command(subcommand)]
    Settings(SettingsCommands),
}

#[derive(Args, Debug)]
pub struct IdArgs {
    pub id: String,
}

#[derive(Args, Debug)]
pub struct RejectArgs {
    pub id: String,
    #[arg(long)]
    pub reason: String,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Video file to stage
    #[arg(long, conflicts_with = "embed_url")]
    pub file: Option<PathBuf>,
    /// Register an embed instead of uploading a file
    #[arg(long, required_unless_present = "file")]
    pub embed_url: Option<String>,
    #[arg(long)]
    pub title: String,
    #[arg(long)]
    pub description: Option<String>,
    /// Custom thumbnail image
    #[arg(long)]
    pub thumbnail: Option<PathBuf>,
    #[arg(long, default_value = "cli")]
    pub owner: String,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    pub status: Option<VideoStatus>,
    #[arg(long)]
    pub owner: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// List queued and active jobs
    Show(QueueShowArgs),
}

#[derive(Args, Debug)]
pub struct QueueShowArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommands {
    /// Consume the queue until interrupted
    Run(WorkerRunArgs),
}

#[derive(Args, Debug)]
pub struct WorkerRunArgs {
    /// Process what is queued now and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,
    /// Override worker.concurrency
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum StorageCommands {
    /// Verify the configured backend is reachable
    Test,
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommands {
    /// Print one key, or every stored key and the resolved settings
    Get { key: Option<String> },
    /// Store a value
    Set { key: String, value: String },
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = load_vidflow_config(&cli.config)?;
    let app = Vidflow::open(config).await?;
    let context = AppContext { app };

    match &cli.command {
        Commands::Status => render(&context.status()?, cli.format)?,
        Commands::Upload(args) => render(&context.upload(args).await?, cli.format)?,
        Commands::Approve(args) => {
            let status = context.app.moderation.approve(&args.id)?;
            render(&StatusChange::new(&args.id, status), cli.format)?;
        }
        Commands::Reject(args) => {
            context.app.moderation.reject(&args.id, &args.reason).await?;
            render(&StatusChange::new(&args.id, VideoStatus::Rejected), cli.format)?;
        }
        Commands::Hide(args) => {
            context.app.moderation.hide(&args.id)?;
            render(&StatusChange::new(&args.id, VideoStatus::Hidden), cli.format)?;
        }
        Commands::Unhide(args) => {
            context.app.moderation.unhide(&args.id)?;
            render(&StatusChange::new(&args.id, VideoStatus::Approved), cli.format)?;
        }
        Commands::Delete(args) => {
            context.app.moderation.delete(&args.id).await?;
            render(&Deleted { id: args.id.clone() }, cli.format)?;
        }
        Commands::List(args) => render(&context.list(args)?, cli.format)?,
        Commands::Show(args) => render(&context.show(&args.id)?, cli.format)?,
        Commands::Queue(QueueCommands::Show(args)) => {
            render(&context.queue_show(args)?, cli.format)?
        }
        Commands::Worker(WorkerCommands::Run(args)) => {
            render(&context.worker_run(args).await?, cli.format)?
        }
        Commands::Storage(StorageCommands::Test) => {
            context.app.storage.health_check().await?;
            render(&StorageCheck { reachable: true }, cli.format)?;
        }
        Commands::Settings(SettingsCommands::Get { key }) => {
            render(&context.settings_get(key.as_deref()).await?, cli.format)?
        }
        Commands::Settings(SettingsCommands::Set { key, value }) => {
            context.app.settings.update(key, value).await?;
            let resolved = context.app.settings.current().await?;
            info!(target: "vidflowctl", key = %key, "setting stored");
            render(&SettingsView::resolved(resolved), cli.format)?;
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

struct AppContext {
    app: Vidflow,
}

impl AppContext {
    fn status(&self) -> Result<StatusReport> {
        let videos = self
            .app
            .videos
            .count_by_status()?
            .into_iter()
            .map(|(status, count)| (status.to_string(), count))
            .collect();
        Ok(StatusReport {
            videos,
            queue: self.app.queue.counts()?,
        })
    }

    async fn upload(&self, args: &UploadArgs) -> Result<UploadReceipt> {
        let video = match &args.file {
            Some(path) => Some(UploadFile::from_path(path, guess_video_mime(path))?),
            None => None,
        };
        let thumbnail = match &args.thumbnail {
            Some(path) => Some(UploadFile::from_path(path, guess_video_mime(path))?),
            None => None,
        };
        let source_type = if args.embed_url.is_some() {
            SourceType::Embed
        } else {
            SourceType::Upload
        };
        let request = UploadRequest {
            video,
            thumbnail,
            metadata: UploadMetadata {
                title: args.title.clone(),
                description: args.description.clone(),
                source_type,
                embed_url: args.embed_url.clone(),
                thumbnail_url: None,
            },
            owner_id: args.owner.clone(),
        };
        Ok(self.app.intake.handle_upload(request).await?)
    }

    fn list(&self, args: &ListArgs) -> Result<VideoList> {
        let rows = self.app.videos.list(&VideoFilter {
            status: args.status,
            owner_id: args.owner.clone(),
            limit: Some(args.limit),
        })?;
        Ok(VideoList { rows })
    }

    fn show(&self, id: &str) -> Result<VideoAsset> {
        self.app
            .videos
            .fetch_by_id(id)?
            .ok_or_else(|| AppError::NotFound(id.to_string()))
    }

    fn queue_show(&self, args: &QueueShowArgs) -> Result<QueueReport> {
        let jobs = self.app.queue.list(&JobFilter {
            status: None,
            limit: Some(args.limit),
        })?;
        Ok(QueueReport {
            counts: self.app.queue.counts()?,
            jobs,
        })
    }

    async fn worker_run(&self, args: &WorkerRunArgs) -> Result<WorkerReport> {
        let mut worker = self.app.worker();
        if let Some(concurrency) = args.concurrency {
            if concurrency == 0 {
                return Err(AppError::InvalidArgument(
                    "concurrency must be at least 1".to_string(),
                ));
            }
            let mut options = worker.options().clone();
            options.concurrency = concurrency;
            worker = vidflow_core::Worker::new(self.app.orchestrator.clone(), options);
        }

        if args.once {
            let outcomes = worker.drain().await?;
            return Ok(WorkerReport {
                processed: outcomes.len(),
                outcomes,
            });
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!(target: "vidflowctl", "interrupt received, finishing in-flight jobs"),
                Err(err) => warn!(target: "vidflowctl", error = %err, "failed to listen for interrupt"),
            }
            let _ = shutdown_tx.send(true);
        });
        let processed = worker.run(shutdown_rx).await?;
        Ok(WorkerReport {
            processed,
            outcomes: Vec::new(),
        })
    }

    async fn settings_get(&self, key: Option<&str>) -> Result<SettingsView> {
        let store = self.app.settings.store();
        match key {
            Some(key) => {
                let value = store.get(key)?.map(|value| mask(key, value));
                Ok(SettingsView::Single {
                    key: key.to_string(),
                    value,
                })
            }
            None => {
                let stored = store
                    .all()?
                    .into_iter()
                    .map(|(key, value)| {
                        let value = mask(&key, value);
                        (key, value)
                    })
                    .collect();
                Ok(SettingsView::All {
                    stored,
                    resolved: self.app.settings.current().await?,
                })
            }
        }
    }
}

fn mask(key: &str, value: String) -> String {
    if key == KEY_R2_SECRET_ACCESS_KEY && !value.is_empty() {
        "********".to_string()
    } else {
        value
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    videos: BTreeMap<String, usize>,
    queue: QueueCounts,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec!["Videos:".to_string()];
        if self.videos.is_empty() {
            lines.push("  (none)".to_string());
        }
        for (status, count) in &self.videos {
            lines.push(format!("  {status:<20} {count}"));
        }
        lines.push(format!(
            "Queue: {} queued, {} active",
            self.queue.queued, self.queue.active
        ));
        lines.join("\n")
    }
}

impl DisplayFallback for UploadReceipt {
    fn display(&self) -> String {
        format!(
            "Staged {} (slug {}, short code {})",
            self.id, self.slug, self.short_code
        )
    }
}

#[derive(Debug, Serialize)]
struct StatusChange {
    id: String,
    status: VideoStatus,
}

impl StatusChange {
    fn new(id: &str, status: VideoStatus) -> Self {
        Self {
            id: id.to_string(),
            status,
        }
    }
}

impl DisplayFallback for StatusChange {
    fn display(&self) -> String {
        format!("{} -> {}", self.id, self.status)
    }
}

#[derive(Debug, Serialize)]
struct Deleted {
    id: String,
}

impl DisplayFallback for Deleted {
    fn display(&self) -> String {
        format!("Deleted {}", self.id)
    }
}

#[derive(Debug, Serialize)]
struct VideoList {
    rows: Vec<VideoAsset>,
}

impl DisplayFallback for VideoList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No videos".to_string();
        }
        self.rows
            .iter()
            .map(|video| {
                format!(
                    "{:<36}  {:<18}  {:>6}s  {:<10}  {}",
                    video.id, video.status, video.duration, video.resolution, video.title
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for VideoAsset {
    fn display(&self) -> String {
        let optional = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());
        let mut lines = vec![
            format!("id:          {}", self.id),
            format!("title:       {}", self.title),
            format!("slug:        {}", self.slug),
            format!("short code:  {}", self.short_code),
            format!("owner:       {}", self.owner_id),
            format!("source:      {}", self.source_type),
            format!("status:      {}", self.status),
            format!("duration:    {}s", self.duration),
            format!("resolution:  {}", self.resolution),
            format!("video url:   {}", optional(&self.video_url)),
            format!("thumbnail:   {}", optional(&self.thumbnail_url)),
            format!("preview:     {}", optional(&self.storyboard_url)),
        ];
        if let Some(reason) = &self.rejection_reason {
            lines.push(format!("rejected:    {reason}"));
        }
        if let Some(path) = &self.local_path {
            lines.push(format!("staged at:   {path}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct QueueReport {
    counts: QueueCounts,
    jobs: Vec<ProcessingJob>,
}

impl DisplayFallback for QueueReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} queued, {} active",
            self.counts.queued, self.counts.active
        )];
        for job in &self.jobs {
            lines.push(format!(
                "#{:<6} {:<36}  {:<7} attempts={} worker={}",
                job.id,
                job.video_id,
                job.status.as_str(),
                job.attempts,
                job.worker.as_deref().unwrap_or("-")
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct WorkerReport {
    processed: usize,
    outcomes: Vec<ProcessingOutcome>,
}

impl DisplayFallback for WorkerReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("Processed {} job(s)", self.processed)];
        for outcome in &self.outcomes {
            let detail = match outcome {
                ProcessingOutcome::Published { video_url, .. } => format!("published {video_url}"),
                ProcessingOutcome::Rejected { reason, .. } => format!("rejected: {reason}"),
                ProcessingOutcome::Failed { error, .. } => format!("failed: {error}"),
                ProcessingOutcome::Skipped { reason, .. } => format!("skipped: {reason}"),
            };
            lines.push(format!("  {}  {detail}", outcome.video_id()));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct StorageCheck {
    reachable: bool,
}

impl DisplayFallback for StorageCheck {
    fn display(&self) -> String {
        "Storage reachable".to_string()
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum SettingsView {
    Single {
        key: String,
        value: Option<String>,
    },
    All {
        stored: BTreeMap<String, String>,
        resolved: vidflow_core::Settings,
    },
    Resolved(vidflow_core::Settings),
}

impl SettingsView {
    fn resolved(settings: vidflow_core::Settings) -> Self {
        SettingsView::Resolved(settings)
    }
}

impl DisplayFallback for SettingsView {
    fn display(&self) -> String {
        match self {
            SettingsView::Single { key, value } => {
                format!("{key} = {}", value.as_deref().unwrap_or("(unset)"))
            }
            SettingsView::All { stored, resolved } => {
                let mut lines: Vec<String> = stored
                    .iter()
                    .map(|(key, value)| format!("{key} = {value}"))
                    .collect();
                lines.push(describe_settings(resolved));
                lines.join("\n")
            }
            SettingsView::Resolved(resolved) => describe_settings(resolved),
        }
    }
}

fn describe_settings(settings: &vidflow_core::Settings) -> String {
    format!(
        "max upload: {} MB, max duration: {}s, max files: {}, mime types: {}, storage: {}",
        settings.max_upload_size_mb,
        settings.max_video_duration,
        settings.max_files_per_upload,
        settings.allowed_mime_types.join(","),
        if settings.storage.is_complete() {
            "configured"
        } else {
            "not configured"
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("vidflow.toml");
        let body = format!(
            "[paths]\nbase_dir = \"{}\"\n\n[storage]\nbackend = \"local\"\n",
            dir.path().display()
        );
        std::fs::write(&path, body).unwrap();
        path
    }

    async fn context(dir: &TempDir) -> AppContext {
        let config = load_vidflow_config(write_config(dir)).unwrap();
        AppContext {
            app: Vidflow::open(config).await.unwrap(),
        }
    }

    #[test]
    fn parses_reject_with_reason() {
        let cli = Cli::try_parse_from(["vidflowctl", "reject", "abc", "--reason", "spam"]).unwrap();
        match cli.command {
            Commands::Reject(args) => {
                assert_eq!(args.id, "abc");
                assert_eq!(args.reason, "spam");
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.format, OutputFormat::Text);
    }

    #[test]
    fn upload_requires_file_or_embed() {
        assert!(Cli::try_parse_from(["vidflowctl", "upload", "--title", "x"]).is_err());
        assert!(Cli::try_parse_from([
            "vidflowctl",
            "upload",
            "--title",
            "x",
            "--file",
            "a.mp4",
            "--embed-url",
            "https://player.example/1",
        ])
        .is_err());
        let cli = Cli::try_parse_from([
            "vidflowctl",
            "--format",
            "json",
            "upload",
            "--title",
            "x",
            "--embed-url",
            "https://player.example/1",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
    }

    #[test]
    fn list_parses_status_filter() {
        let cli =
            Cli::try_parse_from(["vidflowctl", "list", "--status", "pending_processing"]).unwrap();
        match cli.command {
            Commands::List(args) => assert_eq!(args.status, Some(VideoStatus::PendingProcessing)),
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["vidflowctl", "list", "--status", "bogus"]).is_err());
    }

    #[tokio::test]
    async fn settings_round_trip_masks_secret() {
        let dir = TempDir::new().unwrap();
        let context = context(&dir).await;
        context
            .app
            .settings
            .update(KEY_R2_SECRET_ACCESS_KEY, "hunter2")
            .await
            .unwrap();
        match context.settings_get(Some(KEY_R2_SECRET_ACCESS_KEY)).await.unwrap() {
            SettingsView::Single { value, .. } => assert_eq!(value.as_deref(), Some("********")),
            _ => panic!("expected a single value"),
        }
    }

    #[tokio::test]
    async fn status_and_show_on_empty_store() {
        let dir = TempDir::new().unwrap();
        let context = context(&dir).await;
        let status = context.status().unwrap();
        assert!(status.videos.is_empty());
        assert_eq!(status.queue.queued, 0);
        assert!(matches!(context.show("missing"), Err(AppError::NotFound(_))));
    }
}
