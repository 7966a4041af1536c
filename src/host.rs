//! The host-facing processor: wires every component together.

use crate::balancing::{EqualPartitionsBalancingStrategy, PartitionLoadBalancer};
use crate::bootstrap::Bootstrapper;
use crate::config::ProcessorOptions;
use crate::error::{Error, Result};
use crate::estimator::RemainingWorkEstimator;
use crate::lease::{LeaseManager, LeaseStore};
use crate::observer::ObserverFactory;
use crate::processing::{ClosedPartition, PartitionController, PartitionSynchronizer};
use crate::store::{ChangeFeedSource, ItemStore, PartitionTopology};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A change feed processor host.
///
/// Every process taking part in consuming a feed runs one of these with a
/// unique host name; they coordinate only through the shared lease
/// container.
pub struct ChangeFeedProcessor {
    host_name: String,
    options: ProcessorOptions,
    source: Arc<dyn ChangeFeedSource>,
    observer_factory: Arc<dyn ObserverFactory>,
    runtime: Handle,
    lease_manager: Arc<LeaseManager>,
    lease_store: Arc<LeaseStore>,
    synchronizer: Arc<PartitionSynchronizer>,
    started: AtomicBool,
    /// Cancels an in-progress bootstrap.
    startup: Mutex<CancellationToken>,
    balancer: Mutex<Option<Arc<PartitionLoadBalancer>>>,
    /// Controller of the current or most recent run.
    controller: Mutex<Option<Arc<PartitionController>>>,
}

impl ChangeFeedProcessor {
    pub fn builder() -> ChangeFeedProcessorBuilder {
        ChangeFeedProcessorBuilder::default()
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Check whether the processor has been started and not stopped.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Bootstrap the lease container if needed, then start acquiring and
    /// processing partitions.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        match self.start_inner().await {
            Ok(()) => {
                info!(host = %self.host_name, "Change feed processor started");
                Ok(())
            }
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        self.options.validate()?;

        let startup = CancellationToken::new();
        *self.startup.lock() = startup.clone();

        let bootstrapper = Bootstrapper::new(
            self.synchronizer.clone(),
            self.lease_store.clone(),
            self.options.initialization_lock_duration,
            self.options.initialization_poll_interval,
        );
        bootstrapper.initialize(&startup).await?;
        self.launch(&startup)
    }

    /// Start the load balancer unless `startup` was cancelled by `stop`.
    ///
    /// The cancellation check and the publication of the balancer happen
    /// under the balancer lock, so a concurrent `stop` either prevents the
    /// launch or finds the balancer and stops it.
    fn launch(&self, startup: &CancellationToken) -> Result<()> {
        let controller = Arc::new(PartitionController::new(
            self.lease_manager.clone(),
            self.synchronizer.clone(),
            self.source.clone(),
            self.observer_factory.clone(),
            self.options.clone(),
            self.runtime.clone(),
        ));
        let balancer = Arc::new(PartitionLoadBalancer::new(
            controller.clone(),
            self.lease_manager.clone(),
            EqualPartitionsBalancingStrategy::from_options(self.host_name.clone(), &self.options),
            self.options.lease_acquire_interval,
            self.runtime.clone(),
        ));

        let mut slot = self.balancer.lock();
        if startup.is_cancelled() {
            info!(host = %self.host_name, "Stopped during startup, not starting the load balancer");
            return Err(Error::Cancelled);
        }
        balancer.start()?;
        *self.controller.lock() = Some(controller);
        *slot = Some(balancer);
        Ok(())
    }

    /// Stop processing and release every lease this host owns.
    pub async fn stop(&self) -> Result<()> {
        self.startup.lock().cancel();

        let balancer = self.balancer.lock().take();
        let Some(balancer) = balancer else {
            return Err(Error::NotStarted);
        };
        balancer.stop().await?;
        self.started.store(false, Ordering::SeqCst);

        info!(host = %self.host_name, "Change feed processor stopped");
        Ok(())
    }

    /// Estimator over this processor's lease container and feed.
    pub fn estimator(&self) -> RemainingWorkEstimator {
        RemainingWorkEstimator::new(self.lease_manager.clone(), self.source.clone(), self.options.start_from.clone())
    }

    /// Partitions processed by this host right now.
    pub fn running_partitions(&self) -> Vec<String> {
        self.controller
            .lock()
            .as_ref()
            .map(|c| c.running_partitions())
            .unwrap_or_default()
    }

    /// Partitions whose processing ended during the current or last run.
    pub fn closed_partitions(&self) -> Vec<ClosedPartition> {
        self.controller
            .lock()
            .as_ref()
            .map(|c| c.closed_partitions())
            .unwrap_or_default()
    }

    /// Error that stopped the load balancer, if it stopped itself.
    pub fn balancer_failure(&self) -> Option<String> {
        self.balancer.lock().as_ref().and_then(|b| b.failure())
    }
}

impl std::fmt::Debug for ChangeFeedProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedProcessor")
            .field("host_name", &self.host_name)
            .field("started", &self.is_started())
            .field("options", &self.options)
            .finish()
    }
}

/// Builder for [`ChangeFeedProcessor`].
///
/// Host name, feed source, topology, lease container and observer factory
/// are required.
#[derive(Default)]
pub struct ChangeFeedProcessorBuilder {
    host_name: Option<String>,
    source: Option<Arc<dyn ChangeFeedSource>>,
    topology: Option<Arc<dyn PartitionTopology>>,
    lease_container: Option<Arc<dyn ItemStore>>,
    observer_factory: Option<Arc<dyn ObserverFactory>>,
    options: ProcessorOptions,
    runtime: Option<Handle>,
}

impl ChangeFeedProcessorBuilder {
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    pub fn with_feed_source(mut self, source: Arc<dyn ChangeFeedSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_topology(mut self, topology: Arc<dyn PartitionTopology>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn with_lease_container(mut self, container: Arc<dyn ItemStore>) -> Self {
        self.lease_container = Some(container);
        self
    }

    pub fn with_observer_factory(mut self, factory: impl ObserverFactory + 'static) -> Self {
        self.observer_factory = Some(Arc::new(factory));
        self
    }

    pub fn with_options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    /// Runtime the background tasks are spawned on. Defaults to the runtime
    /// `build` is called from.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<ChangeFeedProcessor> {
        let host_name = required(self.host_name, "host name")?;
        if host_name.is_empty() {
            return Err(Error::Config("host name must not be empty".into()));
        }
        let source = required(self.source, "feed source")?;
        let topology = required(self.topology, "partition topology")?;
        let lease_container = required(self.lease_container, "lease container")?;
        let observer_factory = required(self.observer_factory, "observer factory")?;
        self.options.validate()?;

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|e| Error::Config(format!("no runtime given and none running: {e}")))?,
        };

        let options = self.options;
        let lease_manager = Arc::new(LeaseManager::new(
            host_name.clone(),
            lease_container.clone(),
            options.lease_id_prefix(),
        ));
        let lease_store = Arc::new(LeaseStore::new(
            lease_container,
            options.initialized_marker_id(),
            options.lock_id(),
        ));
        let synchronizer = Arc::new(PartitionSynchronizer::new(topology, lease_manager.clone()));

        Ok(ChangeFeedProcessor {
            host_name,
            options,
            source,
            observer_factory,
            runtime,
            lease_manager,
            lease_store,
            synchronizer,
            started: AtomicBool::new(false),
            startup: Mutex::new(CancellationToken::new()),
            balancer: Mutex::new(None),
            controller: Mutex::new(None),
        })
    }
}

fn required<T>(value: Option<T>, what: &str) -> Result<T> {
    value.ok_or_else(|| Error::Config(format!("{what} is required")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, InMemoryChangeFeed, InMemoryItemStore, RecordingObserverFactory};
    use std::time::Duration;

    fn builder(feed: &Arc<InMemoryChangeFeed>, container: &Arc<InMemoryItemStore>) -> ChangeFeedProcessorBuilder {
        ChangeFeedProcessor::builder()
            .with_host_name("a")
            .with_feed_source(feed.clone())
            .with_topology(feed.clone())
            .with_lease_container(container.clone())
            .with_observer_factory(RecordingObserverFactory::new())
            .with_options(ProcessorOptions::for_testing())
    }

    #[tokio::test]
    async fn test_build_requires_collaborators() {
        let err = ChangeFeedProcessor::builder().with_host_name("a").build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let feed = Arc::new(InMemoryChangeFeed::with_partitions(1));
        let container = Arc::new(InMemoryItemStore::new());
        let err = builder(&feed, &container).with_host_name("").build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_build_validates_options() {
        let feed = Arc::new(InMemoryChangeFeed::with_partitions(1));
        let container = Arc::new(InMemoryItemStore::new());
        let err = builder(&feed, &container)
            .with_options(ProcessorOptions::for_testing().with_max_item_count(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let feed = Arc::new(InMemoryChangeFeed::with_partitions(2));
        let container = Arc::new(InMemoryItemStore::new());
        let processor = builder(&feed, &container).build().unwrap();

        assert!(matches!(processor.stop().await, Err(Error::NotStarted)));

        processor.start().await.unwrap();
        assert!(processor.is_started());
        assert!(matches!(processor.start().await, Err(Error::AlreadyStarted)));

        assert!(eventually(Duration::from_secs(10), || async { processor.running_partitions().len() == 2 }).await);

        processor.stop().await.unwrap();
        assert!(!processor.is_started());
        assert!(processor.running_partitions().is_empty());
        assert_eq!(processor.closed_partitions().len(), 2);

        // Restart after stop.
        processor.start().await.unwrap();
        assert!(eventually(Duration::from_secs(10), || async { processor.running_partitions().len() == 2 }).await);
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_after_bootstrap_prevents_launch() {
        let feed = Arc::new(InMemoryChangeFeed::with_partitions(2));
        let container = Arc::new(InMemoryItemStore::new());
        let processor = builder(&feed, &container).build().unwrap();
        processor.synchronizer.create_missing_leases().await.unwrap();

        // Bootstrap has finished; stop lands before the balancer is published.
        let startup = CancellationToken::new();
        *processor.startup.lock() = startup.clone();
        assert!(matches!(processor.stop().await, Err(Error::NotStarted)));

        assert!(matches!(processor.launch(&startup), Err(Error::Cancelled)));
        assert!(processor.balancer.lock().is_none());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(processor.running_partitions().is_empty());
        let leases = processor.lease_manager.list_all_leases().await.unwrap();
        assert_eq!(leases.len(), 2);
        assert!(leases.iter().all(|l| l.owner.is_none()));
    }
}
