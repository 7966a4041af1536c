//! Keeps the lease set aligned with the source's partitions.

use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseManager};
use crate::store::PartitionTopology;
use crate::types::FeedRange;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Derives leases from the partition topology.
#[derive(Debug)]
pub struct PartitionSynchronizer {
    topology: Arc<dyn PartitionTopology>,
    lease_manager: Arc<LeaseManager>,
}

impl PartitionSynchronizer {
    pub fn new(topology: Arc<dyn PartitionTopology>, lease_manager: Arc<LeaseManager>) -> Self {
        Self {
            topology,
            lease_manager,
        }
    }

    /// Create a lease for every partition that has none.
    ///
    /// Partitions whose parent still has a lease are skipped: the parent's
    /// owner creates them when it handles the split. Returns the number of
    /// leases created.
    pub async fn create_missing_leases(&self) -> Result<usize> {
        let ranges = self.topology.list_ranges().await?;
        let leased: HashSet<String> = self
            .lease_manager
            .list_all_leases()
            .await?
            .into_iter()
            .map(|l| l.lease_token)
            .collect();

        let mut created = 0;
        for range in &ranges {
            if leased.contains(&range.id) {
                continue;
            }
            if let Some(parent) = range.parents.iter().find(|p| leased.contains(*p)) {
                debug!(partition_id = %range.id, %parent, "Skipping child of a leased parent");
                continue;
            }
            if self.lease_manager.create_lease_if_not_exists(range, None).await?.is_some() {
                created += 1;
            }
        }

        info!(partitions = ranges.len(), created, "Synchronized leases with partitions");
        Ok(created)
    }

    /// Create the child leases replacing a split partition's lease.
    ///
    /// The children must exactly tile the parent's range; each starts from
    /// the parent's continuation. The parent lease is left in place.
    pub async fn split_partition(&self, lease: &Lease) -> Result<Vec<Lease>> {
        let children: Vec<_> = self
            .topology
            .overlapping_ranges(&lease.feed_range)
            .await?
            .into_iter()
            .filter(|r| r.id != lease.lease_token)
            .collect();

        if children.is_empty() {
            return Err(Error::Topology(format!(
                "no child partitions found for split partition {}",
                lease.lease_token
            )));
        }

        let ranges: Vec<FeedRange> = children.iter().map(|r| r.range.clone()).collect();
        if !lease.feed_range.is_tiled_by(&ranges) {
            return Err(Error::Topology(format!(
                "child partitions of {} do not cover {}",
                lease.lease_token, lease.feed_range
            )));
        }

        for child in &children {
            self.lease_manager
                .create_lease_if_not_exists(child, lease.continuation_token.clone())
                .await?;
        }

        let child_tokens: HashSet<&str> = children.iter().map(|r| r.id.as_str()).collect();
        let leases: Vec<Lease> = self
            .lease_manager
            .list_all_leases()
            .await?
            .into_iter()
            .filter(|l| child_tokens.contains(l.lease_token.as_str()))
            .collect();

        info!(
            lease_token = %lease.lease_token,
            children = ?child_tokens,
            continuation = ?lease.continuation_token,
            "Split lease into child leases"
        );
        Ok(leases)
    }
}
