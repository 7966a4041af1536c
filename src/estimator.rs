//! Backlog estimation from lease checkpoints.

use crate::config::StartFrom;
use crate::error::{Result, StoreError};
use crate::lease::{Lease, LeaseManager};
use crate::store::{ChangeFeedSource, FeedRequest};
use std::sync::Arc;
use tracing::debug;

/// Estimated backlog of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemainingWork {
    pub lease_token: String,
    pub remaining: u64,
}

/// Estimates how many changes are left to process.
///
/// For every lease one change is read after its checkpoint; the distance
/// from that change to the partition's latest offset is the backlog.
///
/// The distance counts changes exactly only when a source numbers the
/// changes of a partition densely. Sources with gaps between offsets (for
/// example a partition holding its parent's history after a split) get an
/// upper bound.
#[derive(Debug)]
pub struct RemainingWorkEstimator {
    lease_manager: Arc<LeaseManager>,
    source: Arc<dyn ChangeFeedSource>,
    start_from: StartFrom,
}

impl RemainingWorkEstimator {
    /// `start_from` is used for leases that were never checkpointed.
    pub fn new(lease_manager: Arc<LeaseManager>, source: Arc<dyn ChangeFeedSource>, start_from: StartFrom) -> Self {
        Self {
            lease_manager,
            source,
            start_from,
        }
    }

    /// Backlog per lease, ordered by lease token.
    pub async fn estimated_remaining_work_per_partition(&self) -> Result<Vec<RemainingWork>> {
        let leases = self.lease_manager.list_all_leases().await?;
        let mut estimates = Vec::with_capacity(leases.len());
        for lease in &leases {
            estimates.push(RemainingWork {
                lease_token: lease.lease_token.clone(),
                remaining: self.remaining_for(lease).await?,
            });
        }
        Ok(estimates)
    }

    /// Total backlog. `1` when no lease exists yet, since an empty lease
    /// container means "not bootstrapped", not "caught up".
    pub async fn estimated_remaining_work(&self) -> Result<u64> {
        let estimates = self.estimated_remaining_work_per_partition().await?;
        if estimates.is_empty() {
            return Ok(1);
        }
        Ok(estimates.iter().map(|e| e.remaining).sum())
    }

    async fn remaining_for(&self, lease: &Lease) -> Result<u64> {
        let start = match &lease.continuation_token {
            Some(token) => StartFrom::Continuation(token.clone()),
            None => self.start_from.clone(),
        };
        let request = FeedRequest {
            partition_id: lease.lease_token.clone(),
            start,
            max_item_count: 1,
        };

        let page = match self.source.read_page(&request).await {
            Ok(page) => page,
            Err(StoreError::PartitionGone(_)) | Err(StoreError::PartitionSplit(_)) => {
                debug!(lease_token = %lease.lease_token, "Partition no longer exists, counting no backlog");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(first) = page.records.first() else {
            return Ok(0);
        };
        let latest = page.latest_offset.unwrap_or(first.offset).max(first.offset);
        Ok(latest - first.offset + 1)
    }
}
