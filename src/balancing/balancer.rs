//! Background loop acquiring leases for this host.

use crate::balancing::EqualPartitionsBalancingStrategy;
use crate::error::{Error, Result};
use crate::lease::LeaseManager;
use crate::processing::{sleep_or_cancelled, PartitionController};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodically lists all leases, asks the strategy which ones to take and
/// hands them to the [`PartitionController`].
///
/// An error in the loop body stops the balancer and shuts the controller
/// down; the error stays available through [`failure`](Self::failure).
pub struct PartitionLoadBalancer {
    controller: Arc<PartitionController>,
    lease_manager: Arc<LeaseManager>,
    strategy: EqualPartitionsBalancingStrategy,
    acquire_interval: Duration,
    runtime: Handle,
    running: Mutex<Option<RunningLoop>>,
    failure: Mutex<Option<String>>,
}

impl PartitionLoadBalancer {
    pub fn new(
        controller: Arc<PartitionController>,
        lease_manager: Arc<LeaseManager>,
        strategy: EqualPartitionsBalancingStrategy,
        acquire_interval: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            controller,
            lease_manager,
            strategy,
            acquire_interval,
            runtime,
            running: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    pub fn controller(&self) -> &Arc<PartitionController> {
        &self.controller
    }

    /// Check whether the loop is running.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled() && !r.handle.is_finished())
    }

    /// Error that stopped the loop, if it stopped itself.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Start the loop. Fails with `AlreadyStarted` if it was started before.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let cancel = CancellationToken::new();
        let handle = self.runtime.spawn(Arc::clone(self).run(cancel.clone()));
        *running = Some(RunningLoop { cancel, handle });

        info!(host = %self.lease_manager.host_name(), "Load balancer started");
        Ok(())
    }

    /// Stop the loop and shut the controller down, releasing every lease.
    pub async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Err(Error::NotStarted);
        };

        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            warn!(error = %e, "Load balancer task ended abnormally");
        }
        self.controller.shutdown().await;

        info!(host = %self.lease_manager.host_name(), "Load balancer stopped");
        Ok(())
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            match self.balance_once(&cancel).await {
                Ok(()) => {}
                Err(Error::Cancelled) => break,
                Err(e) => {
                    error!(host = %self.lease_manager.host_name(), error = %e, "Load balancer failed, stopping");
                    *self.failure.lock() = Some(e.to_string());
                    cancel.cancel();
                    self.controller.shutdown().await;
                    return;
                }
            }

            if !sleep_or_cancelled(&cancel, self.acquire_interval).await {
                break;
            }
        }
        debug!(host = %self.lease_manager.host_name(), "Load balancer loop exited");
    }

    async fn balance_once(&self, cancel: &CancellationToken) -> Result<()> {
        let leases = self.lease_manager.list_all_leases().await?;
        let to_take = self.strategy.select_leases_to_take(&leases);

        for lease in to_take {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.controller.add_or_update_lease(lease).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PartitionLoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionLoadBalancer")
            .field("host", &self.lease_manager.host_name())
            .field("acquire_interval", &self.acquire_interval)
            .field("running", &self.is_running())
            .finish()
    }
}
