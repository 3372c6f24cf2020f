use std::path::Path;

use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::StorageSection;
use crate::settings::{SettingsCache, StorageCredentials};

use super::{ObjectStore, RetryPolicy, StorageError, StorageResult};

/// Cloudflare R2 endpoint for an account.
pub fn r2_endpoint(account_id: &str) -> String {
    format!("https://{account_id}.r2.cloudflarestorage.com")
}

#[derive(Debug, Clone)]
struct BucketClient {
    client: Client,
    bucket: String,
    public_url: Option<String>,
}

/// S3-compatible store. The SDK client is built on first use from the
/// credentials in the settings cache and reused afterwards.
#[derive(Debug)]
pub struct S3ObjectStore {
    settings: SettingsCache,
    endpoint: Option<String>,
    region: String,
    retry: RetryPolicy,
    upload_concurrency: usize,
    client: RwLock<Option<BucketClient>>,
}

impl S3ObjectStore {
    pub fn new(config: &StorageSection, settings: SettingsCache) -> Self {
        Self {
            settings,
            endpoint: config.endpoint.clone(),
            region: config.region.clone(),
            retry: RetryPolicy::from(&config.retry),
            upload_concurrency: config.upload_concurrency.max(1),
            client: RwLock::new(None),
        }
    }

    /// Lists a single key with `credentials`. On success the cached client is
    /// replaced so later calls use the tested credentials.
    pub async fn test_connection(&self, credentials: &StorageCredentials) -> StorageResult<()> {
        let candidate = self.build_client(credentials).await?;
        candidate
            .client
            .list_objects_v2()
            .bucket(&candidate.bucket)
            .max_keys(1)
            .send()
            .await
            .map_err(|err| {
                StorageError::request("list_objects_v2", &candidate.bucket, DisplayErrorContext(err))
            })?;
        info!(target: "storage", bucket = %candidate.bucket, "storage connection verified");
        *self.client.write().await = Some(candidate);
        Ok(())
    }

    /// Drops the cached client so the next call rebuilds it from settings.
    pub async fn reset(&self) {
        *self.client.write().await = None;
    }

    async fn bucket_client(&self) -> StorageResult<BucketClient> {
        if let Some(cached) = self.client.read().await.as_ref() {
            return Ok(cached.clone());
        }
        let mut guard = self.client.write().await;
        if let Some(cached) = guard.as_ref() {
            return Ok(cached.clone());
        }
        let settings = self.settings.current().await?;
        let built = self.build_client(&settings.storage).await?;
        debug!(target: "storage", bucket = %built.bucket, "storage client initialized");
        *guard = Some(built.clone());
        Ok(built)
    }

    async fn build_client(&self, credentials: &StorageCredentials) -> StorageResult<BucketClient> {
        if !credentials.is_complete() {
            return Err(StorageError::NotConfigured);
        }
        let endpoint = self
            .endpoint
            .clone()
            .unwrap_or_else(|| r2_endpoint(&credentials.account_id));
        let provider = Credentials::new(
            &credentials.access_key_id,
            &credentials.secret_access_key,
            None,
            None,
            "vidflow-settings",
        );
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(provider)
            .endpoint_url(endpoint)
            .load()
            .await;
        Ok(BucketClient {
            client: Client::new(&sdk_config),
            bucket: credentials.bucket.clone(),
            public_url: credentials.public_url.clone(),
        })
    }

    async fn put(&self, key: &str, body: ByteStream, content_type: &str) -> StorageResult<()> {
        let target = self.bucket_client().await?;
        target
            .client
            .put_object()
            .bucket(&target.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|err| StorageError::request("put_object", key, DisplayErrorContext(err)))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload_file(
        &self,
        bytes: Vec<u8>,
        key: &str,
        content_type: &str,
    ) -> StorageResult<String> {
        let bytes = bytes.as_slice();
        self.retry
            .run("put_object", key, move || async move {
                self.put(key, ByteStream::from(bytes.to_vec()), content_type)
                    .await
            })
            .await?;
        Ok(key.to_string())
    }

    async fn upload_path(
        &self,
        local: &Path,
        key: &str,
        content_type: &str,
    ) -> StorageResult<String> {
        self.retry
            .run("put_object", key, move || async move {
                let body = ByteStream::from_path(local)
                    .await
                    .map_err(|err| StorageError::request("read_file", key, err))?;
                self.put(key, body, content_type).await
            })
            .await?;
        Ok(key.to_string())
    }

    async fn list_files(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let target = self.bucket_client().await?;
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let response = target
                .client
                .list_objects_v2()
                .bucket(&target.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|err| {
                    StorageError::request("list_objects_v2", prefix, DisplayErrorContext(err))
                })?;
            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn delete_file(&self, key: &str) -> StorageResult<()> {
        let target = self.bucket_client().await?;
        target
            .client
            .delete_object()
            .bucket(&target.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| StorageError::request("delete_object", key, DisplayErrorContext(err)))?;
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let target = self.bucket_client().await?;
        let first = keys[0].clone();
        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| StorageError::request("delete_objects", &first, err))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|err| StorageError::request("delete_objects", &first, err))?;
        target
            .client
            .delete_objects()
            .bucket(&target.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|err| {
                StorageError::request("delete_objects", &first, DisplayErrorContext(err))
            })?;
        Ok(())
    }

    async fn public_url(&self, key: &str) -> StorageResult<String> {
        let target = self.bucket_client().await?;
        Ok(match target.public_url {
            Some(base) => format!("{base}/{key}"),
            None => key.to_string(),
        })
    }

    async fn health_check(&self) -> StorageResult<()> {
        let settings = self.settings.current().await?;
        self.test_connection(&settings.storage).await
    }

    fn upload_concurrency(&self) -> usize {
        self.upload_concurrency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsSection;
    use crate::settings::SettingsStore;

    #[test]
    fn endpoint_uses_account_subdomain() {
        assert_eq!(
            r2_endpoint("abc123"),
            "https://abc123.r2.cloudflarestorage.com"
        );
    }

    #[tokio::test]
    async fn missing_credentials_are_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.sqlite")).unwrap();
        store.initialize().unwrap();
        let cache = SettingsCache::new(store, LimitsSection::default());
        let s3 = S3ObjectStore::new(&StorageSection::default(), cache);
        let err = s3.list_files("videos/").await.unwrap_err();
        assert!(matches!(err, StorageError::NotConfigured));
    }
}
