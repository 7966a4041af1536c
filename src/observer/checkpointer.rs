//! Persisting processing progress into the lease.

use crate::error::Result;
use crate::lease::{Lease, LeaseManager};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Persists the continuation reached on one partition.
#[async_trait]
pub trait PartitionCheckpointer: Send + Sync + std::fmt::Debug {
    async fn checkpoint_partition(&self, continuation: &str) -> Result<()>;
}

/// Checkpoints into the lease of the partition being processed.
///
/// Keeps the most recent copy of the lease so consecutive checkpoints carry a
/// fresh concurrency token.
#[derive(Debug)]
pub struct LeaseCheckpointer {
    lease_manager: Arc<LeaseManager>,
    lease: Mutex<Lease>,
}

impl LeaseCheckpointer {
    pub fn new(lease_manager: Arc<LeaseManager>, lease: Lease) -> Self {
        Self {
            lease_manager,
            lease: Mutex::new(lease),
        }
    }

    /// Last lease copy written or observed by this checkpointer.
    pub fn lease(&self) -> Lease {
        self.lease.lock().clone()
    }
}

#[async_trait]
impl PartitionCheckpointer for LeaseCheckpointer {
    async fn checkpoint_partition(&self, continuation: &str) -> Result<()> {
        let current = self.lease();
        let updated = self.lease_manager.checkpoint(&current, continuation).await?;
        *self.lease.lock() = updated;
        Ok(())
    }
}
