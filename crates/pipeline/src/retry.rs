//! Short, local retries for transient stage errors.
//!
//! Long-horizon retries belong to the recovery engine; this only smooths
//! over blips such as a busy device or a dropped store connection.

use std::future::Future;
use std::time::Duration;

use stowage_core::types::DbId;

use crate::error::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalRetry {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for LocalRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl LocalRetry {
    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, item_id: DbId, mut op: F) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        item_id,
                        operation = label,
                        attempt,
                        error = %e,
                        "Transient stage error, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use stowage_core::store::StoreError;

    fn quick() -> LocalRetry {
        LocalRetry {
            attempts: 3,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = quick()
            .run("hash", 1, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StageError::Store(StoreError::Backend("blip".into())))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = quick()
            .run("zip", 1, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StageError::Join("panicked".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = quick()
            .run("unzip", 1, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StageError::DigestMismatch)
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
