use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::config::RetrySection;

use super::StorageResult;

/// Linear backoff between `delay_ms[0]` and `delay_ms[1]` across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_ms: [u64; 2],
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySection::default())
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            attempts: section.attempts.max(1),
            delay_ms: section.delay_ms,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            delay_ms: [0, 0],
        }
    }

    pub fn compute_delay(&self, attempt: u32) -> Duration {
        if self.attempts <= 2 {
            return Duration::from_millis(self.delay_ms[0]);
        }
        let min = self.delay_ms[0] as f64;
        let max = self.delay_ms[1] as f64;
        let ratio = (attempt as f64) / ((self.attempts - 2) as f64);
        Duration::from_millis((min + (max - min) * ratio.min(1.0)).round() as u64)
    }

    pub async fn run<F, Fut, T>(&self, label: &str, key: &str, mut operation: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 >= attempts || !err.is_retryable() => return Err(err),
                Err(err) => {
                    let delay = self.compute_delay(attempt);
                    warn!(
                        target: "storage",
                        attempt = attempt + 1,
                        wait = ?delay,
                        operation = label,
                        key,
                        error = %err,
                        "retrying storage operation"
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_step_linearly_between_bounds() {
        let policy = RetryPolicy {
            attempts: 3,
            delay_ms: [200, 2_000],
        };
        assert_eq!(policy.compute_delay(0), Duration::from_millis(200));
        assert_eq!(policy.compute_delay(1), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy {
            attempts: 3,
            delay_ms: [0, 0],
        };
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = policy
            .run("put_object", "videos/a/video.mp4", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StorageError::request("put_object", "k", "503"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn configuration_errors_fail_fast() {
        let policy = RetryPolicy {
            attempts: 5,
            delay_ms: [0, 0],
        };
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: StorageResult<()> = policy
            .run("put_object", "k", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::NotConfigured)
            })
            .await;
        assert!(matches!(result, Err(StorageError::NotConfigured)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
