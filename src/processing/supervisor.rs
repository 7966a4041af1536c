//! Lifecycle of one owned partition: observer open/close around the
//! processor and the renewer.

use crate::error::{Error, LeaseLostReason, Result};
use crate::observer::{CloseReason, ObserverContext, PartitionObserver};
use crate::processing::{LeaseRenewer, PartitionProcessor};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs a [`PartitionProcessor`] and a [`LeaseRenewer`] side by side.
///
/// Whichever finishes first cancels the other through a child token, so
/// losing the lease stops processing and a failing processor stops renewal.
pub struct PartitionSupervisor {
    observer: Arc<dyn PartitionObserver>,
    context: ObserverContext,
    processor: PartitionProcessor,
    renewer: LeaseRenewer,
}

impl PartitionSupervisor {
    pub fn new(
        observer: Arc<dyn PartitionObserver>,
        context: ObserverContext,
        processor: PartitionProcessor,
        renewer: LeaseRenewer,
    ) -> Self {
        Self {
            observer,
            context,
            processor,
            renewer,
        }
    }

    pub fn processor(&self) -> &PartitionProcessor {
        &self.processor
    }

    pub fn renewer(&self) -> &LeaseRenewer {
        &self.renewer
    }

    /// Process the partition until `shutdown` fires or something fails.
    ///
    /// Returns the error that ended processing together with the reason the
    /// observer was closed with.
    pub async fn run(&self, shutdown: &CancellationToken) -> (Result<()>, CloseReason) {
        let partition_id = self.context.partition_id();

        if let Err(e) = self.observer.open(&self.context).await {
            warn!(partition_id, error = %e, "Observer failed to open");
            return (Err(e), CloseReason::ObserverError);
        }

        let child = shutdown.child_token();
        let (processed, renewed) = tokio::join!(
            async {
                let result = self.processor.run(&child).await;
                child.cancel();
                result
            },
            async {
                let result = self.renewer.run(&child).await;
                child.cancel();
                result
            },
        );

        let outcome = match (processed, renewed) {
            (Err(Error::Cancelled), Err(e)) if !e.is_cancelled() => Err(e),
            (processed, _) => processed,
        };

        let reason = close_reason(&outcome, shutdown.is_cancelled());
        debug!(partition_id, %reason, "Closing observer");
        if let Err(e) = self.observer.close(&self.context, reason).await {
            warn!(partition_id, error = %e, "Observer failed to close");
        }

        (outcome, reason)
    }
}

fn close_reason(outcome: &Result<()>, shutting_down: bool) -> CloseReason {
    match outcome {
        Err(Error::Cancelled) if shutting_down => CloseReason::Shutdown,
        Err(Error::LeaseLost {
            reason: LeaseLostReason::Deleted,
            ..
        }) => CloseReason::LeaseGone,
        Err(Error::LeaseLost { .. }) => CloseReason::LeaseLost,
        Err(Error::PartitionSplit { .. }) | Err(Error::PartitionNotFound { .. }) => CloseReason::ResourceGone,
        Err(Error::Observer(_)) => CloseReason::ObserverError,
        _ => CloseReason::Unknown,
    }
}

impl std::fmt::Debug for PartitionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionSupervisor")
            .field("context", &self.context)
            .field("processor", &self.processor)
            .finish()
    }
}
