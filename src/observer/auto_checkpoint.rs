//! Automatic checkpointing after processed batches.

use crate::config::CheckpointFrequency;
use crate::error::Result;
use crate::observer::{CloseReason, ObserverContext, PartitionObserver};
use crate::types::ChangeRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct Progress {
    processed: usize,
    last_checkpoint: Instant,
}

/// Checkpoints after successful batches according to a
/// [`CheckpointFrequency`].
///
/// - explicit: never; the observer calls [`ObserverContext::checkpoint`]
/// - neither count nor interval set: after every batch
/// - otherwise: once either threshold is reached
///
/// A failed batch is never checkpointed.
pub struct AutoCheckpointer {
    frequency: CheckpointFrequency,
    inner: Arc<dyn PartitionObserver>,
    progress: Mutex<Progress>,
}

impl AutoCheckpointer {
    pub fn new(frequency: CheckpointFrequency, inner: Arc<dyn PartitionObserver>) -> Self {
        Self {
            frequency,
            inner,
            progress: Mutex::new(Progress {
                processed: 0,
                last_checkpoint: Instant::now(),
            }),
        }
    }

    /// Count `batch_len` processed changes and decide whether to checkpoint.
    fn record_batch(&self, batch_len: usize) -> bool {
        if self.frequency.explicit_checkpoint {
            return false;
        }

        let mut progress = self.progress.lock();
        progress.processed += batch_len;

        match (self.frequency.processed_document_count, self.frequency.time_interval) {
            (None, None) => true,
            (count, interval) => {
                count.is_some_and(|n| progress.processed >= n)
                    || interval.is_some_and(|d| progress.last_checkpoint.elapsed() >= d)
            }
        }
    }

    fn reset(&self) {
        let mut progress = self.progress.lock();
        progress.processed = 0;
        progress.last_checkpoint = Instant::now();
    }
}

#[async_trait]
impl PartitionObserver for AutoCheckpointer {
    async fn open(&self, context: &ObserverContext) -> Result<()> {
        self.reset();
        self.inner.open(context).await
    }

    async fn close(&self, context: &ObserverContext, reason: CloseReason) -> Result<()> {
        self.inner.close(context, reason).await
    }

    async fn process_changes(&self, context: &ObserverContext, changes: &[ChangeRecord]) -> Result<()> {
        self.inner.process_changes(context, changes).await?;

        if self.record_batch(changes.len()) {
            trace!(partition_id = context.partition_id(), "Auto checkpoint");
            context.checkpoint().await?;
            self.reset();
        }
        Ok(())
    }
}
