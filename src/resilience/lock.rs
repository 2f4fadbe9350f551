//! Named async mutexes.
//!
//! Every write to the operation log (local or remote) runs under
//! [`OPERATION_LOG`], which serializes "read clock, increment, append".
//! Quota recovery runs under [`QUOTA_EXCEEDED`] so concurrent writers cannot
//! start overlapping emergency compactions. Quota recovery takes
//! [`OPERATION_LOG`] while holding [`QUOTA_EXCEEDED`]; the reverse order is
//! never taken.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Serializes all operation log writes and compaction.
pub const OPERATION_LOG: &str = "sp_op_log";

/// Serializes storage-quota recovery.
pub const QUOTA_EXCEEDED: &str = "sp_quota_exceeded";

/// Registry of process-wide named locks.
#[derive(Default)]
pub struct LockService {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the named lock. Released when the guard drops.
    pub async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        trace!(lock = name, "Waiting for lock");
        mutex.lock_owned().await
    }

    /// True while someone holds the named lock.
    #[must_use]
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .get(name)
            .is_some_and(|m| m.try_lock().is_err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_serializes_holders() {
        let locks = Arc::new(LockService::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(OPERATION_LOG).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_names_do_not_block() {
        let locks = LockService::new();
        let _log = locks.acquire(OPERATION_LOG).await;
        let _quota = locks.acquire(QUOTA_EXCEEDED).await;
        assert!(locks.is_locked(OPERATION_LOG));
        assert!(locks.is_locked(QUOTA_EXCEEDED));
    }

    #[tokio::test]
    async fn test_log_lock_nests_inside_quota_lock() {
        let locks = Arc::new(LockService::new());
        let _quota = locks.acquire(QUOTA_EXCEEDED).await;
        {
            let _log = locks.acquire(OPERATION_LOG).await;
            assert!(locks.is_locked(QUOTA_EXCEEDED));
        }

        // Plain writers only need the log lock and are not blocked by quota recovery
        let writer = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _log = locks.acquire(OPERATION_LOG).await;
            })
        };
        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer finishes while quota lock is held")
            .unwrap();
    }

    #[tokio::test]
    async fn test_guard_drop_releases() {
        let locks = LockService::new();
        {
            let _g = locks.acquire(OPERATION_LOG).await;
            assert!(locks.is_locked(OPERATION_LOG));
        }
        assert!(!locks.is_locked(OPERATION_LOG));
    }
}
