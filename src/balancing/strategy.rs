//! Equal-share lease distribution.

use crate::config::ProcessorOptions;
use crate::lease::Lease;
use crate::types::now_ms;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Decides which leases this host should try to take so that every active
/// host ends up with an equal share.
///
/// Pure: the decision depends only on the lease set and the clock reading
/// passed to [`select_leases_to_take_at`](Self::select_leases_to_take_at).
#[derive(Debug, Clone)]
pub struct EqualPartitionsBalancingStrategy {
    host_name: String,
    min_partition_count: usize,
    max_partition_count: usize,
    lease_expiration_interval: Duration,
}

impl EqualPartitionsBalancingStrategy {
    /// `min`/`max` of zero mean unbounded.
    pub fn new(
        host_name: impl Into<String>,
        min_partition_count: usize,
        max_partition_count: usize,
        lease_expiration_interval: Duration,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            min_partition_count,
            max_partition_count,
            lease_expiration_interval,
        }
    }

    pub fn from_options(host_name: impl Into<String>, options: &ProcessorOptions) -> Self {
        Self::new(
            host_name,
            options.min_scale_count,
            options.max_scale_count,
            options.lease_expiration_interval,
        )
    }

    pub fn select_leases_to_take(&self, leases: &[Lease]) -> Vec<Lease> {
        self.select_leases_to_take_at(leases, now_ms())
    }

    /// Select the leases to take given the clock reading `now_ms`.
    pub fn select_leases_to_take_at(&self, leases: &[Lease], now_ms: u64) -> Vec<Lease> {
        if leases.is_empty() {
            return Vec::new();
        }

        // Active leases per owner. This host always counts as a worker.
        let mut owner_counts: BTreeMap<&str, usize> = BTreeMap::new();
        owner_counts.insert(self.host_name.as_str(), 0);

        let mut expired: Vec<&Lease> = Vec::new();
        for lease in leases {
            match lease.owner.as_deref() {
                Some(owner) if !lease.is_expired(now_ms, self.lease_expiration_interval) => {
                    *owner_counts.entry(owner).or_default() += 1;
                }
                _ => expired.push(lease),
            }
        }

        let target = self.target_count(leases.len(), owner_counts.len());
        let mine = owner_counts.get(self.host_name.as_str()).copied().unwrap_or(0);
        let need = target.saturating_sub(mine);
        if need == 0 {
            return Vec::new();
        }

        if !expired.is_empty() {
            expired.sort_by(|a, b| a.lease_token.cmp(&b.lease_token));
            let taken: Vec<Lease> = expired.into_iter().take(need).cloned().collect();
            debug!(
                host = %self.host_name,
                target,
                mine,
                taking = ?taken.iter().map(|l| l.lease_token.as_str()).collect::<Vec<_>>(),
                "Selected expired leases"
            );
            return taken;
        }

        self.lease_to_steal(leases, &owner_counts, target, need)
            .map(|lease| {
                debug!(
                    host = %self.host_name,
                    lease_token = %lease.lease_token,
                    from = ?lease.owner,
                    target,
                    mine,
                    "Selected lease to steal"
                );
                vec![lease.clone()]
            })
            .unwrap_or_default()
    }

    fn target_count(&self, partitions: usize, workers: usize) -> usize {
        let mut target = partitions.div_ceil(workers.max(1)).max(1);
        if self.max_partition_count > 0 && target > self.max_partition_count {
            target = self.max_partition_count;
        }
        if self.min_partition_count > 0 && target < self.min_partition_count {
            target = self.min_partition_count;
        }
        target
    }

    /// One lease of the most loaded other host, if that host is over its
    /// share. Ties go to the lexicographically smallest host name.
    fn lease_to_steal<'a>(
        &self,
        leases: &'a [Lease],
        owner_counts: &BTreeMap<&str, usize>,
        target: usize,
        need: usize,
    ) -> Option<&'a Lease> {
        let (busiest, count) = owner_counts
            .iter()
            .filter(|(owner, _)| **owner != self.host_name)
            .fold(None, |best: Option<(&str, usize)>, (owner, count)| match best {
                Some((_, best_count)) if best_count >= *count => best,
                _ => Some((*owner, *count)),
            })?;

        let threshold = if need > 1 { target.saturating_sub(1) } else { target };
        if count <= threshold {
            return None;
        }

        leases
            .iter()
            .filter(|l| l.owner.as_deref() == Some(busiest))
            .min_by(|a, b| a.lease_token.cmp(&b.lease_token))
    }
}
