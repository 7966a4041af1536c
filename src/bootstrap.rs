//! One-time population of the lease container.

use crate::error::{Error, Result};
use crate::lease::LeaseStore;
use crate::processing::{sleep_or_cancelled, PartitionSynchronizer};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Creates the initial lease set exactly once across all hosts.
///
/// Hosts race for a TTL lock record; the winner creates leases for every
/// partition and writes the initialized marker, everyone else polls until
/// the marker appears. A host dying mid-bootstrap leaves only the lock
/// behind, which expires and lets another host retry.
#[derive(Debug)]
pub struct Bootstrapper {
    synchronizer: Arc<PartitionSynchronizer>,
    lease_store: Arc<LeaseStore>,
    lock_duration: Duration,
    poll_interval: Duration,
}

impl Bootstrapper {
    pub fn new(
        synchronizer: Arc<PartitionSynchronizer>,
        lease_store: Arc<LeaseStore>,
        lock_duration: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            synchronizer,
            lease_store,
            lock_duration,
            poll_interval,
        }
    }

    /// Return once the lease container is initialized.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if self.lease_store.is_initialized().await? {
                debug!("Lease container already initialized");
                return Ok(());
            }

            if !self.lease_store.acquire_initialization_lock(self.lock_duration).await? {
                debug!(poll_interval = ?self.poll_interval, "Another host is initializing the lease container");
                if !sleep_or_cancelled(cancel, self.poll_interval).await {
                    return Err(Error::Cancelled);
                }
                continue;
            }

            info!("Initializing lease container");
            let result = self.populate().await;

            match self.lease_store.release_initialization_lock().await {
                Ok(true) => {}
                Ok(false) => warn!("Initialization lock expired before it was released"),
                Err(e) => warn!(error = %e, "Failed to release initialization lock"),
            }

            return result;
        }
    }

    async fn populate(&self) -> Result<()> {
        let created = self.synchronizer.create_missing_leases().await?;
        self.lease_store.mark_initialized().await?;
        info!(created, "Lease container initialized");
        Ok(())
    }
}
