//! Observers that record what the processor delivered.

use crate::observer::{
    ChangeFeedObserver, CloseReason, ObserverContext, ObserverFactory, ObserverResult,
};
use crate::types::{ChangeRecord, PartitionId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One delivery event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    Opened(PartitionId),
    Batch { partition_id: PartitionId, ids: Vec<String>, offsets: Vec<u64> },
    Closed(PartitionId, CloseReason),
}

/// Shared log written by every [`RecordingObserver`] of one factory.
#[derive(Debug, Default)]
pub struct ObserverLog {
    events: Mutex<Vec<ObserverEvent>>,
    /// Remaining batches to fail, per partition.
    failures: Mutex<BTreeMap<PartitionId, usize>>,
    checkpoint_explicitly: Mutex<bool>,
    batches: AtomicUsize,
}

impl ObserverLog {
    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().clone()
    }

    /// Every change id delivered, with duplicates.
    pub fn delivered_ids(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ObserverEvent::Batch { ids, .. } => Some(ids.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Distinct change ids delivered.
    pub fn distinct_ids(&self) -> BTreeSet<String> {
        self.delivered_ids().into_iter().collect()
    }

    /// Offsets delivered for `partition_id`, in delivery order.
    pub fn offsets(&self, partition_id: &str) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ObserverEvent::Batch { partition_id: p, offsets, .. } if p == partition_id => Some(offsets.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Number of successful batches.
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Partitions opened, in order, with repeats.
    pub fn opened(&self) -> Vec<PartitionId> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ObserverEvent::Opened(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    /// Close reasons recorded for `partition_id`.
    pub fn close_reasons(&self, partition_id: &str) -> Vec<CloseReason> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ObserverEvent::Closed(p, reason) if p == partition_id => Some(*reason),
                _ => None,
            })
            .collect()
    }

    /// Fail the next `count` batches of `partition_id`.
    pub fn fail_batches(&self, partition_id: &str, count: usize) {
        self.failures.lock().insert(partition_id.to_string(), count);
    }

    /// Make observers call [`ObserverContext::checkpoint`] after every batch.
    pub fn checkpoint_explicitly(&self, enabled: bool) {
        *self.checkpoint_explicitly.lock() = enabled;
    }

    fn take_failure(&self, partition_id: &str) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(partition_id) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Observer appending everything it sees to an [`ObserverLog`].
#[derive(Debug)]
pub struct RecordingObserver {
    log: Arc<ObserverLog>,
    delay: Option<Duration>,
}

#[async_trait]
impl ChangeFeedObserver for RecordingObserver {
    async fn open(&self, context: &ObserverContext) -> ObserverResult {
        self.log
            .events
            .lock()
            .push(ObserverEvent::Opened(context.partition_id().to_string()));
        Ok(())
    }

    async fn close(&self, context: &ObserverContext, reason: CloseReason) -> ObserverResult {
        self.log
            .events
            .lock()
            .push(ObserverEvent::Closed(context.partition_id().to_string(), reason));
        Ok(())
    }

    async fn process_changes(&self, context: &ObserverContext, changes: &[ChangeRecord]) -> ObserverResult {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.log.take_failure(context.partition_id()) {
            return Err(format!("injected failure on partition {}", context.partition_id()).into());
        }

        self.log.events.lock().push(ObserverEvent::Batch {
            partition_id: context.partition_id().to_string(),
            ids: changes.iter().map(|c| c.id.clone()).collect(),
            offsets: changes.iter().map(|c| c.offset).collect(),
        });
        self.log.batches.fetch_add(1, Ordering::SeqCst);

        let explicit = *self.log.checkpoint_explicitly.lock();
        if explicit {
            context.checkpoint().await?;
        }
        Ok(())
    }
}

/// Factory handing out [`RecordingObserver`]s that share one log.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserverFactory {
    log: Arc<ObserverLog>,
    delay: Option<Duration>,
}

impl RecordingObserverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep `delay` in every `process_changes` call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn log(&self) -> Arc<ObserverLog> {
        self.log.clone()
    }
}

impl ObserverFactory for RecordingObserverFactory {
    fn create_observer(&self) -> Box<dyn ChangeFeedObserver> {
        Box::new(RecordingObserver {
            log: self.log.clone(),
            delay: self.delay,
        })
    }
}
