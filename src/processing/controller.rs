//! Owns the set of partitions this host is processing.

use crate::config::ProcessorOptions;
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseManager};
use crate::observer::{
    AutoCheckpointer, CloseReason, LeaseCheckpointer, ObserverContext, ObserverExceptionWrapper, ObserverFactory,
    PartitionObserver,
};
use crate::processing::{
    LeaseRenewer, PartitionProcessor, PartitionProcessorSettings, PartitionSupervisor, PartitionSynchronizer,
};
use crate::store::ChangeFeedSource;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Number of most recent [`ClosedPartition`] entries kept by a controller.
pub const CLOSED_PARTITIONS_RETAINED: usize = 128;

/// How processing of one partition ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedPartition {
    pub lease_token: String,
    pub reason: CloseReason,
    /// Error that stopped processing; `None` on shutdown.
    pub error: Option<String>,
}

/// Starts one supervised processor per acquired lease and reacts to how
/// each one ends.
///
/// | Outcome              | Action                                  |
/// |----------------------|-----------------------------------------|
/// | partition split      | create child leases, delete the parent  |
/// | partition not found  | delete the lease                        |
/// | lease lost           | nothing, the lease belongs to another   |
/// | shutdown / any other | release the lease                       |
pub struct PartitionController {
    lease_manager: Arc<LeaseManager>,
    synchronizer: Arc<PartitionSynchronizer>,
    source: Arc<dyn ChangeFeedSource>,
    observer_factory: Arc<dyn ObserverFactory>,
    options: ProcessorOptions,
    runtime: Handle,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    /// Cancellation token of every partition being processed, by lease token.
    running: DashMap<String, CancellationToken>,
    /// Most recent closures, bounded by [`CLOSED_PARTITIONS_RETAINED`].
    closed: Mutex<VecDeque<ClosedPartition>>,
}

impl PartitionController {
    pub fn new(
        lease_manager: Arc<LeaseManager>,
        synchronizer: Arc<PartitionSynchronizer>,
        source: Arc<dyn ChangeFeedSource>,
        observer_factory: Arc<dyn ObserverFactory>,
        options: ProcessorOptions,
        runtime: Handle,
    ) -> Self {
        Self {
            lease_manager,
            synchronizer,
            source,
            observer_factory,
            options,
            runtime,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            running: DashMap::new(),
            closed: Mutex::new(VecDeque::new()),
        }
    }

    /// Lease tokens of the partitions being processed, sorted.
    pub fn running_partitions(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        tokens.sort();
        tokens
    }

    /// Partitions whose processing has ended, oldest first. Only the last
    /// [`CLOSED_PARTITIONS_RETAINED`] closures are reported.
    pub fn closed_partitions(&self) -> Vec<ClosedPartition> {
        self.closed.lock().iter().cloned().collect()
    }

    fn record_closed(&self, closed: ClosedPartition) {
        let mut report = self.closed.lock();
        if report.len() == CLOSED_PARTITIONS_RETAINED {
            report.pop_front();
        }
        report.push_back(closed);
    }

    /// Start processing `lease`, or refresh its properties if it already runs.
    ///
    /// Losing the acquisition race to another host is not an error.
    pub async fn add_or_update_lease(self: &Arc<Self>, lease: Lease) -> Result<()> {
        if self.shutdown.is_cancelled() {
            debug!(lease_token = %lease.lease_token, "Controller shut down, ignoring lease");
            return Ok(());
        }

        let token = lease.lease_token.clone();
        let cancel = match self.running.entry(token.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let cancel = self.shutdown.child_token();
                slot.insert(cancel.clone());
                Some(cancel)
            }
        };

        let Some(cancel) = cancel else {
            return match self.lease_manager.update_properties(&lease).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_lease_lost() => {
                    debug!(lease_token = %token, error = %e, "Running lease no longer owned");
                    Ok(())
                }
                Err(e) => Err(e),
            };
        };

        let acquired = match self.lease_manager.acquire(&lease).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.running.remove(&token);
                if e.is_lease_lost() {
                    info!(lease_token = %token, "Lease acquired by another host first");
                    return Ok(());
                }
                return Err(e);
            }
        };

        self.tasks
            .spawn_on(Arc::clone(self).run_partition(acquired, cancel), &self.runtime);
        Ok(())
    }

    /// Stop every partition, release their leases and wait for completion.
    pub async fn shutdown(&self) {
        let running = self.running.len();
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!(partitions = running, "Partition controller shut down");
    }

    fn run_partition(self: Arc<Self>, lease: Lease, cancel: CancellationToken) -> BoxFuture<'static, ()> {
        async move {
            let token = lease.lease_token.clone();
            let checkpointer = Arc::new(LeaseCheckpointer::new(self.lease_manager.clone(), lease.clone()));
            let context = ObserverContext::new(token.clone(), checkpointer.clone());

            let wrapped: Arc<dyn PartitionObserver> =
                Arc::new(ObserverExceptionWrapper::new(self.observer_factory.create_observer()));
            let observer: Arc<dyn PartitionObserver> =
                Arc::new(AutoCheckpointer::new(self.options.checkpoint_frequency.clone(), wrapped));

            let processor = PartitionProcessor::new(
                PartitionProcessorSettings::for_lease(&lease, &self.options),
                self.source.clone(),
                observer.clone(),
                context.clone(),
            );
            let renewer = LeaseRenewer::new(self.lease_manager.clone(), lease.clone(), self.options.lease_renew_interval);
            let supervisor = PartitionSupervisor::new(observer, context, processor, renewer);

            info!(lease_token = %token, continuation = ?lease.continuation_token, "Partition processing started");
            let (outcome, reason) = supervisor.run(&cancel).await;

            let error = match &outcome {
                Err(e) if !e.is_cancelled() => Some(e.to_string()),
                _ => None,
            };
            self.complete(checkpointer.lease(), outcome).await;
            self.running.remove(&token);

            info!(lease_token = %token, %reason, "Partition processing stopped");
            self.record_closed(ClosedPartition {
                lease_token: token,
                reason,
                error,
            });
        }
        .boxed()
    }

    async fn complete(self: &Arc<Self>, lease: Lease, outcome: Result<()>) {
        match outcome {
            Err(Error::PartitionSplit { last_continuation, .. }) => {
                if let Err(e) = self.handle_split(&lease, last_continuation).await {
                    warn!(lease_token = %lease.lease_token, error = %e, "Failed to handle partition split");
                    self.release(&lease).await;
                }
            }
            Err(Error::PartitionNotFound { .. }) => {
                info!(lease_token = %lease.lease_token, "Partition gone, retiring lease");
                if let Err(e) = self.lease_manager.delete(&lease).await {
                    warn!(lease_token = %lease.lease_token, error = %e, "Failed to delete lease");
                }
            }
            Err(e) if e.is_lease_lost() => {
                debug!(lease_token = %lease.lease_token, "Lease lost, nothing to release");
            }
            _ => self.release(&lease).await,
        }
    }

    async fn release(&self, lease: &Lease) {
        match self.lease_manager.release(lease).await {
            Ok(()) => {}
            Err(e) if e.is_lease_lost() => {
                debug!(lease_token = %lease.lease_token, "Lease already taken over");
            }
            Err(e) => {
                warn!(lease_token = %lease.lease_token, error = %e, "Failed to release lease");
            }
        }
    }

    /// Replace a split partition's lease by leases for its children and start
    /// processing them.
    pub async fn handle_split(self: &Arc<Self>, lease: &Lease, last_continuation: Option<String>) -> Result<()> {
        let mut parent = lease.clone();
        if last_continuation.is_some() {
            parent.continuation_token = last_continuation;
        }

        let children = self.synchronizer.split_partition(&parent).await?;
        self.lease_manager.delete(lease).await?;

        for child in children {
            let child_token = child.lease_token.clone();
            if let Err(e) = self.add_or_update_lease(child).await {
                warn!(lease_token = %child_token, error = %e, "Failed to start child partition");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PartitionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionController")
            .field("host", &self.lease_manager.host_name())
            .field("running", &self.running_partitions())
            .finish()
    }
}
