//! Feed polling loop for one partition.

use crate::config::{ProcessorOptions, StartFrom};
use crate::error::{Error, Result, StoreError};
use crate::lease::Lease;
use crate::observer::{ObserverContext, PartitionObserver};
use crate::processing::sleep_or_cancelled;
use crate::store::{ChangeFeedSource, FeedRequest};
use crate::types::PartitionId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Snapshot of what a processor needs, taken when it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionProcessorSettings {
    pub partition_id: PartitionId,
    pub start_from: StartFrom,
    pub max_item_count: usize,
    pub feed_poll_delay: Duration,
}

impl PartitionProcessorSettings {
    /// Settings resuming `lease` from its checkpoint, or from the configured
    /// start position if it has none.
    pub fn for_lease(lease: &Lease, options: &ProcessorOptions) -> Self {
        let start_from = match &lease.continuation_token {
            Some(token) => StartFrom::Continuation(token.clone()),
            None => options.start_from.clone(),
        };
        Self {
            partition_id: lease.lease_token.clone(),
            start_from,
            max_item_count: options.max_item_count,
            feed_poll_delay: options.feed_poll_delay,
        }
    }
}

/// What to do after a failed page read.
#[derive(Debug)]
enum Recovery {
    RetryNow,
    RetryAfter(Duration),
    Stop(Error),
}

/// Reads a partition's change feed and hands batches to the observer.
///
/// The loop only ends with an error: `Cancelled` on shutdown,
/// `PartitionSplit`/`PartitionNotFound` for topology changes, or a terminal
/// error which is also kept in [`result_error`](Self::result_error).
pub struct PartitionProcessor {
    settings: PartitionProcessorSettings,
    source: Arc<dyn ChangeFeedSource>,
    observer: Arc<dyn PartitionObserver>,
    context: ObserverContext,
    last_continuation: Mutex<Option<String>>,
    result_error: Mutex<Option<String>>,
}

impl PartitionProcessor {
    pub fn new(
        settings: PartitionProcessorSettings,
        source: Arc<dyn ChangeFeedSource>,
        observer: Arc<dyn PartitionObserver>,
        context: ObserverContext,
    ) -> Self {
        let last_continuation = match &settings.start_from {
            StartFrom::Continuation(token) => Some(token.clone()),
            _ => None,
        };
        Self {
            settings,
            source,
            observer,
            context,
            last_continuation: Mutex::new(last_continuation),
            result_error: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &PartitionProcessorSettings {
        &self.settings
    }

    /// Continuation of the last page read.
    pub fn last_continuation(&self) -> Option<String> {
        self.last_continuation.lock().clone()
    }

    /// Terminal error that stopped the loop, if any.
    pub fn result_error(&self) -> Option<String> {
        self.result_error.lock().clone()
    }

    /// Run until cancelled or stopped by an error.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let partition_id = self.settings.partition_id.as_str();
        let mut start = self.settings.start_from.clone();
        let mut page_size = self.settings.max_item_count;

        debug!(partition_id, start = ?start, "Partition processor started");

        loop {
            // One poll: pages until the feed is drained.
            loop {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let request = FeedRequest {
                    partition_id: partition_id.to_string(),
                    start: start.clone(),
                    max_item_count: page_size,
                };

                let page = match self.source.read_page(&request).await {
                    Ok(page) => page,
                    Err(e) => match self.classify(e, &mut page_size) {
                        Recovery::RetryNow => continue,
                        Recovery::RetryAfter(delay) => {
                            if !sleep_or_cancelled(cancel, delay).await {
                                return Err(Error::Cancelled);
                            }
                            continue;
                        }
                        Recovery::Stop(error) => return Err(self.stop_with(error)),
                    },
                };

                start = StartFrom::Continuation(page.continuation.clone());
                *self.last_continuation.lock() = Some(page.continuation.clone());

                if page.is_empty() {
                    break;
                }

                trace!(partition_id, count = page.records.len(), continuation = %page.continuation, "Dispatching batch");
                let context = self.context.with_continuation(page.continuation);
                if let Err(e) = self.observer.process_changes(&context, &page.records).await {
                    return Err(self.stop_with(e));
                }
            }

            if page_size != self.settings.max_item_count {
                debug!(partition_id, page_size = self.settings.max_item_count, "Restoring page size");
                page_size = self.settings.max_item_count;
            }

            if !sleep_or_cancelled(cancel, self.settings.feed_poll_delay).await {
                return Err(Error::Cancelled);
            }
        }
    }

    fn classify(&self, error: StoreError, page_size: &mut usize) -> Recovery {
        let partition_id = &self.settings.partition_id;
        match error {
            StoreError::PartitionGone(_) => Recovery::Stop(Error::PartitionNotFound {
                partition_id: partition_id.clone(),
                last_continuation: self.last_continuation(),
            }),
            StoreError::PartitionSplit(_) => Recovery::Stop(Error::PartitionSplit {
                partition_id: partition_id.clone(),
                last_continuation: self.last_continuation(),
            }),
            StoreError::PageTooLarge { requested } => {
                if *page_size <= 1 {
                    warn!(%partition_id, requested, "Page size cannot be reduced further");
                    Recovery::Stop(Error::Store(StoreError::PageTooLarge { requested }))
                } else {
                    *page_size = (*page_size / 2).max(1);
                    debug!(%partition_id, page_size = *page_size, "Reducing page size");
                    Recovery::RetryNow
                }
            }
            StoreError::Throttled { retry_after } => {
                debug!(%partition_id, ?retry_after, "Throttled, backing off");
                Recovery::RetryAfter(retry_after)
            }
            other => Recovery::Stop(Error::Store(other)),
        }
    }

    fn stop_with(&self, error: Error) -> Error {
        match &error {
            Error::Cancelled | Error::PartitionSplit { .. } | Error::PartitionNotFound { .. } => {}
            Error::LeaseLost { .. } => {
                debug!(partition_id = %self.settings.partition_id, error = %error, "Partition processor lost its lease");
            }
            _ => {
                warn!(partition_id = %self.settings.partition_id, error = %error, "Partition processor failed");
                *self.result_error.lock() = Some(error.to_string());
            }
        }
        error
    }
}

impl std::fmt::Debug for PartitionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionProcessor")
            .field("settings", &self.settings)
            .field("last_continuation", &self.last_continuation())
            .field("result_error", &self.result_error())
            .finish()
    }
}
