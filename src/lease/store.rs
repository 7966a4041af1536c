//! Initialization marker and bootstrap lock records.

use crate::error::{Result, StoreError};
use crate::store::{ItemStore, StoredItem};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Control-plane records of the lease container.
///
/// `<prefix>.info` marks the container as bootstrapped; `<prefix>.lock` is a
/// TTL record giving one host the right to bootstrap.
#[derive(Debug)]
pub struct LeaseStore {
    container: Arc<dyn ItemStore>,
    marker_id: String,
    lock_id: String,
    /// Concurrency token of the lock we created, if we hold it.
    lock_etag: Mutex<Option<String>>,
}

impl LeaseStore {
    /// Create a lease store over `container`.
    pub fn new(container: Arc<dyn ItemStore>, marker_id: impl Into<String>, lock_id: impl Into<String>) -> Self {
        Self {
            container,
            marker_id: marker_id.into(),
            lock_id: lock_id.into(),
            lock_etag: Mutex::new(None),
        }
    }

    /// Check whether the container has been bootstrapped.
    pub async fn is_initialized(&self) -> Result<bool> {
        match self.container.read_item(&self.marker_id).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Create the initialized marker. A concurrent creation counts as success.
    pub async fn mark_initialized(&self) -> Result<bool> {
        let marker = StoredItem::new(self.marker_id.clone(), Vec::new());
        match self.container.create_item(marker).await {
            Ok(_) => {
                info!(marker_id = %self.marker_id, "Lease container marked initialized");
                Ok(true)
            }
            Err(StoreError::Conflict(_)) => {
                debug!(marker_id = %self.marker_id, "Lease container already marked initialized");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Try to take the bootstrap lock for `duration`.
    ///
    /// Returns `false` when another host holds it.
    pub async fn acquire_initialization_lock(&self, duration: Duration) -> Result<bool> {
        let lock = StoredItem::new(self.lock_id.clone(), Vec::new()).with_ttl(duration);
        match self.container.create_item(lock).await {
            Ok(created) => {
                debug!(lock_id = %self.lock_id, ?duration, "Acquired initialization lock");
                *self.lock_etag.lock() = created.etag;
                Ok(true)
            }
            Err(StoreError::Conflict(_)) => {
                debug!(lock_id = %self.lock_id, "Initialization lock held by another host");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release the bootstrap lock taken by [`acquire_initialization_lock`].
    ///
    /// Returns `false` if the lock changed or disappeared meanwhile (for
    /// example its TTL expired and another host took it).
    ///
    /// [`acquire_initialization_lock`]: LeaseStore::acquire_initialization_lock
    pub async fn release_initialization_lock(&self) -> Result<bool> {
        let etag = self.lock_etag.lock().take();
        let Some(etag) = etag else {
            return Ok(false);
        };

        match self.container.delete_item(&self.lock_id, Some(&etag)).await {
            Ok(()) => {
                debug!(lock_id = %self.lock_id, "Released initialization lock");
                Ok(true)
            }
            Err(StoreError::PreconditionFailed(_)) | Err(StoreError::NotFound(_)) | Err(StoreError::Conflict(_)) => {
                debug!(lock_id = %self.lock_id, "Initialization lock already changed or removed");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryItemStore;

    fn store(container: &Arc<InMemoryItemStore>) -> LeaseStore {
        LeaseStore::new(container.clone(), ".info", ".lock")
    }

    #[tokio::test]
    async fn test_marker_is_idempotent() {
        let container = Arc::new(InMemoryItemStore::new());
        let store = store(&container);

        assert!(!store.is_initialized().await.unwrap());
        assert!(store.mark_initialized().await.unwrap());
        assert!(store.mark_initialized().await.unwrap());
        assert!(store.is_initialized().await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let container = Arc::new(InMemoryItemStore::new());
        let a = store(&container);
        let b = store(&container);

        assert!(a.acquire_initialization_lock(Duration::from_secs(30)).await.unwrap());
        assert!(!b.acquire_initialization_lock(Duration::from_secs(30)).await.unwrap());

        // b never held it.
        assert!(!b.release_initialization_lock().await.unwrap());
        assert!(a.release_initialization_lock().await.unwrap());

        assert!(b.acquire_initialization_lock(Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_after_lock_replaced() {
        let container = Arc::new(InMemoryItemStore::new());
        let a = store(&container);
        let b = store(&container);

        assert!(a.acquire_initialization_lock(Duration::from_secs(30)).await.unwrap());

        // Simulate TTL expiry followed by another host taking the lock.
        container.delete_item(".lock", None).await.unwrap();
        assert!(b.acquire_initialization_lock(Duration::from_secs(30)).await.unwrap());

        assert!(!a.release_initialization_lock().await.unwrap());
        assert!(b.release_initialization_lock().await.unwrap());
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let container = Arc::new(InMemoryItemStore::new());
        let store = store(&container);

        container.fail_next_read(StoreError::Unavailable("down".into()));
        assert!(store.is_initialized().await.is_err());
    }
}
