//! In-process per-device locks.
//!
//! [`DeviceLocks`] implements [`LockPort`] with one async mutex per device
//! serial. The returned [`ExclusiveGuard`] owns the mutex guard, so the lock
//! is released when the guard is dropped, including when the task holding it
//! panics or is aborted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::traits::{ExclusiveGuard, LockPort};

/// One async mutex per device.
#[derive(Debug, Default)]
pub struct DeviceLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
    acquire_timeout: Option<Duration>,
}

impl DeviceLocks {
    /// Create an empty lock table. Waiting is unbounded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up waiting for a lock after `timeout`.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Whether `device_id` is currently held.
    pub fn is_locked(&self, device_id: &str) -> bool {
        self.locks
            .get(device_id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    fn lock_for(&self, device_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(device_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }
}

#[async_trait]
impl LockPort for DeviceLocks {
    async fn acquire(&self, device_id: &str) -> Result<ExclusiveGuard> {
        let lock = self.lock_for(device_id);
        let guard = match self.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, lock.lock_owned())
                .await
                .map_err(|_| Error::timeout(format!("lock {}", device_id), timeout))?,
            None => lock.lock_owned().await,
        };
        debug!("Locked {}", device_id);
        Ok(ExclusiveGuard::new(guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::with_exclusive;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let locks = DeviceLocks::new();
        let guard = locks.acquire("M1").await.unwrap();
        assert!(locks.is_locked("M1"));
        assert!(!locks.is_locked("M2"));
        drop(guard);
        assert!(!locks.is_locked("M1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout() {
        let locks = DeviceLocks::new().with_acquire_timeout(Duration::from_secs(5));
        let _held = locks.acquire("M1").await.unwrap();

        let err = locks.acquire("M1").await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        // Other devices are unaffected.
        locks.acquire("M2").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_exclusive_serializes_one_device() {
        let locks = Arc::new(DeviceLocks::new());
        let inside = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                with_exclusive(locks.as_ref(), "M1", || async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_exclusive_propagates_errors() {
        let locks = DeviceLocks::new();
        let result: Result<()> = with_exclusive(&locks, "M1", || async {
            Err(Error::InvalidData("boom".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::InvalidData(_))));
        assert!(!locks.is_locked("M1"));
    }
}
