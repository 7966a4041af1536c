//! Configuration types for the change feed processor.

use crate::error::{Error, Result};
use std::time::Duration;

/// Where a partition starts reading when its lease carries no continuation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StartFrom {
    /// Only changes made after the processor started.
    #[default]
    Now,
    /// Every change retained by the source.
    Beginning,
    /// Changes made at or after the given UNIX time in milliseconds.
    Time(u64),
    /// Resume from an explicit continuation token.
    Continuation(String),
}

/// When the auto-checkpointer persists progress.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointFrequency {
    /// Only checkpoint when the observer asks for it.
    pub explicit_checkpoint: bool,

    /// Checkpoint after this many processed documents.
    pub processed_document_count: Option<usize>,

    /// Checkpoint once this much time has passed since the last checkpoint.
    pub time_interval: Option<Duration>,
}

impl CheckpointFrequency {
    /// Leave checkpointing entirely to the observer.
    pub fn explicit() -> Self {
        Self {
            explicit_checkpoint: true,
            ..Default::default()
        }
    }

    /// Checkpoint every `count` documents.
    pub fn every_documents(count: usize) -> Self {
        Self {
            processed_document_count: Some(count),
            ..Default::default()
        }
    }

    /// Checkpoint every `interval`.
    pub fn every(interval: Duration) -> Self {
        Self {
            time_interval: Some(interval),
            ..Default::default()
        }
    }
}

/// Main configuration for the change feed processor.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// How often an owned lease is renewed.
    pub lease_renew_interval: Duration,

    /// How often the load balancer looks for leases to take.
    pub lease_acquire_interval: Duration,

    /// A lease not renewed for this long is considered abandoned.
    pub lease_expiration_interval: Duration,

    /// Delay between polls once a partition has been drained.
    pub feed_poll_delay: Duration,

    /// Prefix of all lease and control record ids.
    pub lease_prefix: String,

    /// Maximum number of changes per page.
    pub max_item_count: usize,

    /// Start position for partitions without a checkpoint.
    pub start_from: StartFrom,

    /// Minimum number of partitions this host wants (0 = no minimum).
    pub min_scale_count: usize,

    /// Maximum number of partitions this host takes (0 = no limit).
    pub max_scale_count: usize,

    /// Auto-checkpoint policy.
    pub checkpoint_frequency: CheckpointFrequency,

    /// Time-to-live of the bootstrap lock record.
    pub initialization_lock_duration: Duration,

    /// Wait between bootstrap attempts while another host holds the lock.
    pub initialization_poll_interval: Duration,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            lease_renew_interval: Duration::from_secs(17),
            lease_acquire_interval: Duration::from_secs(13),
            lease_expiration_interval: Duration::from_secs(60),
            feed_poll_delay: Duration::from_secs(5),
            lease_prefix: String::new(),
            max_item_count: 100,
            start_from: StartFrom::default(),
            min_scale_count: 0,
            max_scale_count: 0,
            checkpoint_frequency: CheckpointFrequency::default(),
            initialization_lock_duration: Duration::from_secs(30),
            initialization_poll_interval: Duration::from_secs(15),
        }
    }
}

impl ProcessorOptions {
    /// Short intervals suitable for tests.
    pub fn for_testing() -> Self {
        Self {
            lease_renew_interval: Duration::from_millis(200),
            lease_acquire_interval: Duration::from_millis(100),
            lease_expiration_interval: Duration::from_secs(2),
            feed_poll_delay: Duration::from_millis(50),
            start_from: StartFrom::Beginning,
            initialization_lock_duration: Duration::from_secs(5),
            initialization_poll_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    /// Set the lease renew interval.
    pub fn with_lease_renew_interval(mut self, interval: Duration) -> Self {
        self.lease_renew_interval = interval;
        self
    }

    /// Set the lease acquire interval.
    pub fn with_lease_acquire_interval(mut self, interval: Duration) -> Self {
        self.lease_acquire_interval = interval;
        self
    }

    /// Set the lease expiration interval.
    pub fn with_lease_expiration_interval(mut self, interval: Duration) -> Self {
        self.lease_expiration_interval = interval;
        self
    }

    /// Set the feed poll delay.
    pub fn with_feed_poll_delay(mut self, delay: Duration) -> Self {
        self.feed_poll_delay = delay;
        self
    }

    /// Set the lease prefix.
    pub fn with_lease_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.lease_prefix = prefix.into();
        self
    }

    /// Set the page size.
    pub fn with_max_item_count(mut self, count: usize) -> Self {
        self.max_item_count = count;
        self
    }

    /// Set the start position for partitions without a checkpoint.
    pub fn with_start_from(mut self, start_from: StartFrom) -> Self {
        self.start_from = start_from;
        self
    }

    /// Set the min and max number of partitions per host.
    pub fn with_scale_counts(mut self, min: usize, max: usize) -> Self {
        self.min_scale_count = min;
        self.max_scale_count = max;
        self
    }

    /// Set the checkpoint frequency.
    pub fn with_checkpoint_frequency(mut self, frequency: CheckpointFrequency) -> Self {
        self.checkpoint_frequency = frequency;
        self
    }

    /// Set the bootstrap lock duration and poll interval.
    pub fn with_initialization_timing(mut self, lock_duration: Duration, poll_interval: Duration) -> Self {
        self.initialization_lock_duration = lock_duration;
        self.initialization_poll_interval = poll_interval;
        self
    }

    /// Id of the record marking the lease container as initialized.
    pub fn initialized_marker_id(&self) -> String {
        format!("{}.info", self.lease_prefix)
    }

    /// Id of the bootstrap lock record.
    pub fn lock_id(&self) -> String {
        format!("{}.lock", self.lease_prefix)
    }

    /// Prefix shared by all lease record ids.
    pub fn lease_id_prefix(&self) -> String {
        format!("{}..", self.lease_prefix)
    }

    /// Check that the options are consistent.
    pub fn validate(&self) -> Result<()> {
        if self.max_item_count == 0 {
            return Err(Error::Config("max_item_count must be > 0".into()));
        }
        if self.lease_renew_interval.is_zero()
            || self.lease_acquire_interval.is_zero()
            || self.lease_expiration_interval.is_zero()
        {
            return Err(Error::Config("lease intervals must be > 0".into()));
        }
        if self.lease_renew_interval >= self.lease_expiration_interval {
            return Err(Error::Config(format!(
                "lease_renew_interval ({:?}) must be shorter than lease_expiration_interval ({:?})",
                self.lease_renew_interval, self.lease_expiration_interval
            )));
        }
        if self.min_scale_count > 0
            && self.max_scale_count > 0
            && self.min_scale_count > self.max_scale_count
        {
            return Err(Error::Config(format!(
                "min_scale_count ({}) exceeds max_scale_count ({})",
                self.min_scale_count, self.max_scale_count
            )));
        }
        if self.checkpoint_frequency.processed_document_count == Some(0) {
            return Err(Error::Config("processed_document_count must be > 0".into()));
        }
        Ok(())
    }
}
