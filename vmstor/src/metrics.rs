//! Storage engine counters.
//!
//! All counters are monotonic. Delta calculation is the caller's job.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counter storage, cloned into every component that records.
#[derive(Clone, Default)]
pub struct StorageMetricsStorage {
    pub(crate) commands_total: Arc<AtomicU64>,
    pub(crate) commands_failed: Arc<AtomicU64>,
    pub(crate) snapshots_created: Arc<AtomicU64>,
    /// Live snapshots that fell back to a full VM snapshot
    pub(crate) snapshot_fallbacks: Arc<AtomicU64>,
    pub(crate) attaches: Arc<AtomicU64>,
    pub(crate) detaches: Arc<AtomicU64>,
    pub(crate) detach_timeouts: Arc<AtomicU64>,
}

impl StorageMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Cloneable read handle over [`StorageMetricsStorage`].
#[derive(Clone)]
pub struct StorageMetrics {
    storage: StorageMetricsStorage,
}

impl StorageMetrics {
    pub(crate) fn new(storage: StorageMetricsStorage) -> Self {
        Self { storage }
    }

    /// Commands handled by the facade, successful or not.
    pub fn commands_total(&self) -> u64 {
        self.storage.commands_total.load(Ordering::Relaxed)
    }

    pub fn commands_failed_total(&self) -> u64 {
        self.storage.commands_failed.load(Ordering::Relaxed)
    }

    pub fn snapshots_created_total(&self) -> u64 {
        self.storage.snapshots_created.load(Ordering::Relaxed)
    }

    pub fn snapshot_fallbacks_total(&self) -> u64 {
        self.storage.snapshot_fallbacks.load(Ordering::Relaxed)
    }

    pub fn attaches_total(&self) -> u64 {
        self.storage.attaches.load(Ordering::Relaxed)
    }

    pub fn detaches_total(&self) -> u64 {
        self.storage.detaches.load(Ordering::Relaxed)
    }

    /// Detaches that were issued but never confirmed within their budget.
    pub fn detach_timeouts_total(&self) -> u64 {
        self.storage.detach_timeouts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_sees_storage_updates() {
        let storage = StorageMetricsStorage::new();
        let metrics = StorageMetrics::new(storage.clone());

        StorageMetricsStorage::incr(&storage.attaches);
        StorageMetricsStorage::incr(&storage.attaches);
        StorageMetricsStorage::incr(&storage.detach_timeouts);

        assert_eq!(metrics.attaches_total(), 2);
        assert_eq!(metrics.detach_timeouts_total(), 1);
        assert_eq!(metrics.snapshots_created_total(), 0);
    }
}
