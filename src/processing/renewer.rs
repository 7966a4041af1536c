//! Keeps an owned lease fresh while its partition is processed.

use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseManager};
use crate::processing::sleep_or_cancelled;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Renews a lease every `renew_interval`, the first time after half of it.
///
/// Transient store failures are logged and retried at the next tick;
/// `LeaseLost` ends the renewer.
#[derive(Debug)]
pub struct LeaseRenewer {
    lease_manager: Arc<LeaseManager>,
    lease: Mutex<Lease>,
    renew_interval: Duration,
}

impl LeaseRenewer {
    pub fn new(lease_manager: Arc<LeaseManager>, lease: Lease, renew_interval: Duration) -> Self {
        Self {
            lease_manager,
            lease: Mutex::new(lease),
            renew_interval,
        }
    }

    /// Last renewed copy of the lease.
    pub fn lease(&self) -> Lease {
        self.lease.lock().clone()
    }

    /// Run until cancelled or the lease is lost.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let mut delay = self.renew_interval / 2;

        loop {
            if !sleep_or_cancelled(cancel, delay).await {
                return Err(Error::Cancelled);
            }
            delay = self.renew_interval;

            let current = self.lease();
            match self.lease_manager.renew(&current).await {
                Ok(renewed) => *self.lease.lock() = renewed,
                Err(e) if e.is_lease_lost() => {
                    debug!(lease_token = %current.lease_token, error = %e, "Lease lost during renewal");
                    return Err(e);
                }
                Err(e) => {
                    warn!(lease_token = %current.lease_token, error = %e, "Failed to renew lease");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::testing::InMemoryItemStore;
    use crate::types::{FeedRange, PartitionKeyRange};

    async fn owned_lease(container: &Arc<InMemoryItemStore>, host: &str) -> (Arc<LeaseManager>, Lease) {
        let manager = Arc::new(LeaseManager::new(host, container.clone(), ".."));
        let lease = manager
            .create_lease_if_not_exists(&PartitionKeyRange::new("0", FeedRange::full()), None)
            .await
            .unwrap()
            .unwrap();
        let lease = manager.acquire(&lease).await.unwrap();
        (manager, lease)
    }

    #[tokio::test(start_paused = true)]
    async fn test_renews_until_cancelled() {
        let container = Arc::new(InMemoryItemStore::new());
        let (manager, lease) = owned_lease(&container, "a").await;
        let writes_before = container.write_count();

        let renewer = Arc::new(LeaseRenewer::new(manager, lease, Duration::from_secs(10)));
        let cancel = CancellationToken::new();
        let task = {
            let renewer = renewer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { renewer.run(&cancel).await })
        };

        // Renewals at 5s, 15s and 25s.
        tokio::time::sleep(Duration::from_secs(26)).await;
        cancel.cancel();

        assert!(task.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(container.write_count() - writes_before, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_lease_is_taken() {
        let container = Arc::new(InMemoryItemStore::new());
        let (manager, lease) = owned_lease(&container, "a").await;
        let thief = LeaseManager::new("b", container.clone(), "..");
        thief.acquire(&lease).await.unwrap();

        let renewer = LeaseRenewer::new(manager, lease, Duration::from_secs(10));
        let err = renewer.run(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_lease_lost());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let container = Arc::new(InMemoryItemStore::new());
        let (manager, lease) = owned_lease(&container, "a").await;
        container.fail_next_write(StoreError::Unavailable("blip".into()));

        let renewer = Arc::new(LeaseRenewer::new(manager, lease.clone(), Duration::from_secs(10)));
        let cancel = CancellationToken::new();
        let task = {
            let renewer = renewer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { renewer.run(&cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(16)).await;
        cancel.cancel();
        assert!(task.await.unwrap().unwrap_err().is_cancelled());
        assert_ne!(renewer.lease().concurrency_token, lease.concurrency_token);
    }
}
