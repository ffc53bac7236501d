//! Work Registry
//!
//! Process-local bookkeeping for in-flight asynchronous jobs and per-object
//! reconciliation locks. The registry is the sole mechanism preventing
//! duplicate provisioning, deletion, or recycling when watch events or the
//! periodic resync fire repeatedly while a job is running.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

// =============================================================================
// Work Registry
// =============================================================================

/// Deduplicates detached side-effect tasks by object identity.
///
/// Keys are object UIDs (Volume UID for delete/recycle, Claim UID for
/// provision). A task removes its own key on exit, success or failure, so a
/// later reconciliation can launch a fresh attempt.
#[derive(Default)]
pub struct WorkRegistry {
    running: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl WorkRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `job` as a detached task unless one is already in flight for
    /// `key`. Returns whether a new task was launched.
    pub fn start_unique<F>(&self, key: impl Into<String>, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let mut running = self.running.lock();
        if running.contains_key(&key) {
            debug!(%key, "job already in flight, skipping");
            return false;
        }

        let table = Arc::clone(&self.running);
        let cleanup_key = key.clone();
        let handle = tokio::spawn(async move {
            job.await;
            table.lock().remove(&cleanup_key);
        });
        running.insert(key, handle);
        true
    }

    /// Whether a job is currently registered for `key`.
    pub fn is_running(&self, key: &str) -> bool {
        self.running.lock().contains_key(key)
    }

    /// Number of in-flight jobs.
    pub fn len(&self) -> usize {
        self.running.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.lock().is_empty()
    }

    /// Abort all in-flight jobs. Used on shutdown; external work a job
    /// already started (e.g. a scrubber worker) may continue and is adopted
    /// after restart via its deterministic identity.
    pub fn abort_all(&self) {
        let mut running = self.running.lock();
        for (key, handle) in running.drain() {
            debug!(%key, "aborting in-flight job");
            handle.abort();
        }
    }

    /// Wait until no jobs are in flight. Test helper; polling is fine at
    /// the scale of a test fixture.
    pub async fn wait_idle(&self) {
        while !self.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

// =============================================================================
// Keyed Locks
// =============================================================================

/// Per-object-identity async mutexes.
///
/// Reconciliations for the same identity are serialized; different
/// identities proceed in parallel. Lock objects are created on demand and
/// retained for the controller's lifetime (the key space is the set of live
/// object names, which is small).
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the lock for a key.
    pub fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_unique_deduplicates() {
        let registry = WorkRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = counter.clone();
            registry.start_unique("vol-uid-1", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
            });
        }

        // Only the first launch goes through while the job is in flight.
        assert_eq!(registry.len(), 1);
        registry.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_key_reusable_after_completion() {
        let registry = WorkRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        assert!(registry.start_unique("k", async move {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        registry.wait_idle().await;

        let c = counter.clone();
        assert!(registry.start_unique("k", async move {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        registry.wait_idle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_concurrently() {
        let registry = WorkRegistry::new();
        assert!(registry.start_unique("a", async {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }));
        assert!(registry.start_unique("b", async {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }));
        assert_eq!(registry.len(), 2);
        registry.wait_idle().await;
    }

    #[tokio::test]
    async fn test_abort_all_clears_registry() {
        let registry = WorkRegistry::new();
        registry.start_unique("stuck", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert!(registry.is_running("stuck"));

        registry.abort_all();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let lock = locks.lock_for("volume/v1");
                let _guard = lock.lock().await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
