use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::LimitsSection;
use crate::sqlite::{open_configured, open_flags};

const SETTINGS_SCHEMA: &str = include_str!("../../sql/settings.sql");

pub const KEY_MAX_UPLOAD_SIZE_MB: &str = "max_upload_size_mb";
pub const KEY_MAX_VIDEO_DURATION: &str = "max_video_duration";
pub const KEY_MAX_FILES_PER_UPLOAD: &str = "max_files_per_upload";
pub const KEY_ALLOWED_MIME_TYPES: &str = "allowed_mime_types";
pub const KEY_R2_ACCOUNT_ID: &str = "r2_account_id";
pub const KEY_R2_ACCESS_KEY_ID: &str = "r2_access_key_id";
pub const KEY_R2_SECRET_ACCESS_KEY: &str = "r2_secret_access_key";
pub const KEY_R2_BUCKET: &str = "r2_bucket_name";
pub const KEY_R2_PUBLIC_URL: &str = "r2_public_url";

pub const KNOWN_KEYS: [&str; 9] = [
    KEY_MAX_UPLOAD_SIZE_MB,
    KEY_MAX_VIDEO_DURATION,
    KEY_MAX_FILES_PER_UPLOAD,
    KEY_ALLOWED_MIME_TYPES,
    KEY_R2_ACCOUNT_ID,
    KEY_R2_ACCESS_KEY_ID,
    KEY_R2_SECRET_ACCESS_KEY,
    KEY_R2_BUCKET,
    KEY_R2_PUBLIC_URL,
];

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to open settings database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("settings database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("settings store path not configured")]
    MissingStore,
    #[error("invalid value for setting {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("unknown setting: {0}")]
    UnknownKey(String),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// Credentials and bucket coordinates for the S3-compatible gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageCredentials {
    pub account_id: String,
    pub access_key_id: String,
    #[serde(skip_serializing)]
    pub secret_access_key: String,
    pub bucket: String,
    pub public_url: Option<String>,
}

impl StorageCredentials {
    pub fn is_complete(&self) -> bool {
        !self.account_id.is_empty()
            && !self.access_key_id.is_empty()
            && !self.secret_access_key.is_empty()
            && !self.bucket.is_empty()
    }
}

/// Resolved runtime settings, with config defaults applied to unset keys.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub max_upload_size_mb: u64,
    pub max_video_duration: i64,
    pub max_files_per_upload: usize,
    pub allowed_mime_types: Vec<String>,
    pub storage: StorageCredentials,
}

impl Settings {
    pub fn from_defaults(limits: &LimitsSection) -> Self {
        Self {
            max_upload_size_mb: limits.max_upload_size_mb,
            max_video_duration: limits.max_video_duration,
            max_files_per_upload: limits.max_files_per_upload,
            allowed_mime_types: limits.allowed_mime_types.clone(),
            storage: StorageCredentials::default(),
        }
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn is_mime_allowed(&self, mime: &str) -> bool {
        self.allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(mime))
    }

    /// Malformed stored values are logged and replaced by the config default.
    fn resolve(limits: &LimitsSection, raw: &HashMap<String, String>) -> Self {
        let mut settings = Self::from_defaults(limits);
        settings.max_upload_size_mb =
            stored_or(raw, KEY_MAX_UPLOAD_SIZE_MB, limits.max_upload_size_mb);
        settings.max_video_duration =
            stored_or(raw, KEY_MAX_VIDEO_DURATION, limits.max_video_duration);
        settings.max_files_per_upload =
            stored_or(raw, KEY_MAX_FILES_PER_UPLOAD, limits.max_files_per_upload);
        if let Some(value) = non_empty(raw, KEY_ALLOWED_MIME_TYPES) {
            let types: Vec<String> = value
                .split(',')
                .map(|item| item.trim().to_ascii_lowercase())
                .filter(|item| !item.is_empty())
                .collect();
            if !types.is_empty() {
                settings.allowed_mime_types = types;
            }
        }
        let text = |key: &str| non_empty(raw, key).unwrap_or_default().to_string();
        settings.storage = StorageCredentials {
            account_id: text(KEY_R2_ACCOUNT_ID),
            access_key_id: text(KEY_R2_ACCESS_KEY_ID),
            secret_access_key: text(KEY_R2_SECRET_ACCESS_KEY),
            bucket: text(KEY_R2_BUCKET),
            public_url: non_empty(raw, KEY_R2_PUBLIC_URL)
                .map(|url| url.trim_end_matches('/').to_string()),
        };
        settings
    }
}

/// Checks a value before it is written. Empty values clear the override.
pub fn check_value(key: &str, value: &str) -> SettingsResult<()> {
    if !KNOWN_KEYS.contains(&key) {
        return Err(SettingsError::UnknownKey(key.to_string()));
    }
    let value = value.trim();
    if value.is_empty() {
        return Ok(());
    }
    let invalid = || SettingsError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    };
    match key {
        KEY_MAX_UPLOAD_SIZE_MB | KEY_MAX_FILES_PER_UPLOAD => {
            if parse_value::<u64>(key, value)? == 0 {
                return Err(invalid());
            }
        }
        KEY_MAX_VIDEO_DURATION => {
            if parse_value::<i64>(key, value)? <= 0 {
                return Err(invalid());
            }
        }
        KEY_ALLOWED_MIME_TYPES => {
            let well_formed = value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .all(|item| item.contains('/'));
            if !well_formed {
                return Err(invalid());
            }
        }
        _ => {}
    }
    Ok(())
}

fn stored_or<T>(raw: &HashMap<String, String>, key: &str, fallback: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    let Some(value) = non_empty(raw, key) else {
        return fallback;
    };
    match parse_value(key, value) {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(
                target: "settings",
                key,
                value,
                fallback = %fallback,
                "ignoring malformed stored setting"
            );
            fallback
        }
    }
}

fn non_empty<'a>(raw: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    raw.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> SettingsResult<T> {
    value.parse().map_err(|_| SettingsError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct SettingsStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SettingsStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SettingsStoreBuilder {
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

    pub fn build(self) -> SettingsResult<SettingsStore> {
        let path = self.path.ok_or(SettingsError::MissingStore)?;
        let flags = open_flags(self.read_only, self.create_if_missing);
        Ok(SettingsStore { path, flags })
    }
}

/// Key/value table behind the settings cache.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SettingsStore {
    pub fn builder() -> SettingsStoreBuilder {
        SettingsStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> SettingsResult<Self> {
        SettingsStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> SettingsResult<Connection> {
        open_configured(&self.path, self.flags).map_err(|source| SettingsError::Open {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> SettingsResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SETTINGS_SCHEMA)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> SettingsResult<Option<String>> {
        let conn = self.open()?;
        let value = conn
            .query_row(
                "SELECT value FROM site_settings WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &str) -> SettingsResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO site_settings (key, value, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> SettingsResult<bool> {
        let conn = self.open()?;
        let affected = conn.execute("DELETE FROM site_settings WHERE key = ?1", [key])?;
        Ok(affected > 0)
    }

    pub fn all(&self) -> SettingsResult<HashMap<String, String>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT key, value FROM site_settings")?;
        let mut map = HashMap::new();
        for row in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })? {
            let (key, value) = row?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

/// Snapshot cache over [`SettingsStore`]. Reads hit memory once warmed;
/// writes go through the store and drop the snapshot.
#[derive(Debug, Clone)]
pub struct SettingsCache {
    store: SettingsStore,
    defaults: LimitsSection,
    snapshot: Arc<RwLock<Option<Settings>>>,
}

impl SettingsCache {
    pub fn new(store: SettingsStore, defaults: LimitsSection) -> Self {
        Self {
            store,
            defaults,
            snapshot: Arc::new(RwLock::new(None)),
        }
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    pub async fn warm(&self) -> SettingsResult<Settings> {
        let raw = self.store.all()?;
        let settings = Settings::resolve(&self.defaults, &raw);
        *self.snapshot.write().await = Some(settings.clone());
        info!(
            target: "settings",
            keys = raw.len(),
            max_video_duration = settings.max_video_duration,
            "settings cache warmed"
        );
        Ok(settings)
    }

    pub async fn current(&self) -> SettingsResult<Settings> {
        if let Some(settings) = self.snapshot.read().await.as_ref() {
            return Ok(settings.clone());
        }
        self.warm().await
    }

    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
        debug!(target: "settings", "settings cache invalidated");
    }

    pub async fn update(&self, key: &str, value: &str) -> SettingsResult<()> {
        check_value(key, value)?;
        self.store.set(key, value)?;
        self.invalidate().await;
        Ok(())
    }
}
