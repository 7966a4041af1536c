//! Load balancing across hosts sharing one lease container.
//!
//! # Test Cases
//!
//! | Scenario                     | Verification                               |
//! |------------------------------|--------------------------------------------|
//! | Second host joins            | leases are stolen until the split is even  |
//! | Host stops                   | released leases move to the remaining host |
//! | Host dies                    | expired leases are taken over              |
//! | Max scale count              | a host never takes more than its limit     |

#[cfg(test)]
mod tests {
    use crate::config::ProcessorOptions;
    use crate::host::ChangeFeedProcessor;
    use crate::lease::LeaseManager;
    use crate::store::PartitionTopology;
    use crate::testing::{eventually, InMemoryChangeFeed, InMemoryItemStore, RecordingObserverFactory};
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;

    const WAIT: Duration = Duration::from_secs(15);

    // =========================================================================
    // Fleet Fixture
    // =========================================================================

    /// Hosts processing one feed through one lease container.
    struct Fleet {
        feed: Arc<InMemoryChangeFeed>,
        container: Arc<InMemoryItemStore>,
        factory: RecordingObserverFactory,
    }

    impl Fleet {
        fn new(partitions: usize) -> Self {
            Self {
                feed: Arc::new(InMemoryChangeFeed::with_partitions(partitions)),
                container: Arc::new(InMemoryItemStore::new()),
                factory: RecordingObserverFactory::new(),
            }
        }

        fn host(&self, name: &str, options: ProcessorOptions) -> ChangeFeedProcessor {
            ChangeFeedProcessor::builder()
                .with_host_name(name)
                .with_feed_source(self.feed.clone())
                .with_topology(self.feed.clone())
                .with_lease_container(self.container.clone())
                .with_observer_factory(self.factory.clone())
                .with_options(options)
                .build()
                .unwrap()
        }

        fn manager(&self, host: &str) -> LeaseManager {
            LeaseManager::new(
                host,
                self.container.clone(),
                ProcessorOptions::for_testing().lease_id_prefix(),
            )
        }

        async fn owned_by(&self, host: &str) -> usize {
            self.manager("reader")
                .list_all_leases()
                .await
                .map(|leases| leases.iter().filter(|l| l.is_owned_by(host)).count())
                .unwrap_or(0)
        }
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_joining_host_gets_equal_share() {
        let fleet = Fleet::new(4);
        let a = fleet.host("a", ProcessorOptions::for_testing());
        let b = fleet.host("b", ProcessorOptions::for_testing());

        a.start().await.unwrap();
        assert!(eventually(WAIT, || async { a.running_partitions().len() == 4 }).await);

        b.start().await.unwrap();
        assert!(
            eventually(WAIT, || async {
                a.running_partitions().len() == 2
                    && b.running_partitions().len() == 2
                    && fleet.owned_by("a").await == 2
                    && fleet.owned_by("b").await == 2
            })
            .await
        );

        // Every partition is processed by exactly one host.
        let mut all = a.running_partitions();
        all.extend(b.running_partitions());
        all.sort();
        assert_eq!(all, vec!["0", "1", "2", "3"]);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_stopped_host_hands_over_leases() {
        let fleet = Fleet::new(4);
        let a = fleet.host("a", ProcessorOptions::for_testing());
        let b = fleet.host("b", ProcessorOptions::for_testing());

        a.start().await.unwrap();
        b.start().await.unwrap();
        assert!(
            eventually(WAIT, || async {
                a.running_partitions().len() + b.running_partitions().len() == 4
                    && !a.running_partitions().is_empty()
                    && !b.running_partitions().is_empty()
            })
            .await
        );

        a.stop().await.unwrap();
        assert_eq!(fleet.owned_by("a").await, 0);
        assert!(eventually(WAIT, || async { b.running_partitions().len() == 4 }).await);

        // Changes written after the handover still arrive.
        for partition in ["0", "1", "2", "3"] {
            fleet.feed.append(partition, format!("late-{partition}"), "x").unwrap();
        }
        let log = fleet.factory.log();
        assert!(
            eventually(WAIT, || async {
                let ids = log.distinct_ids();
                ["0", "1", "2", "3"].iter().all(|p| ids.contains(&format!("late-{p}")))
            })
            .await
        );

        b.stop().await.unwrap();
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_dead_host_leases_expire_and_move() {
        let fleet = Fleet::new(3);
        let options = ProcessorOptions::for_testing()
            .with_lease_renew_interval(Duration::from_millis(100))
            .with_lease_expiration_interval(Duration::from_millis(500));

        // A host that acquired every lease and then died without releasing.
        let ghost = fleet.manager("ghost");
        let ranges = fleet.feed.list_ranges().await.unwrap();
        for range in &ranges {
            ghost.create_lease_if_not_exists(range, None).await.unwrap();
        }
        for lease in ghost.list_all_leases().await.unwrap() {
            ghost.acquire(&lease).await.unwrap();
        }
        let marker = crate::lease::LeaseStore::new(
            fleet.container.clone(),
            options.initialized_marker_id(),
            options.lock_id(),
        );
        marker.mark_initialized().await.unwrap();

        let a = fleet.host("a", options);
        a.start().await.unwrap();
        assert!(eventually(WAIT, || async { a.running_partitions().len() == 3 }).await);
        assert_eq!(fleet.owned_by("ghost").await, 0);

        a.stop().await.unwrap();
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_max_scale_count_limits_host() {
        let fleet = Fleet::new(3);
        let a = fleet.host("a", ProcessorOptions::for_testing().with_scale_counts(0, 1));

        a.start().await.unwrap();
        assert!(eventually(WAIT, || async { a.running_partitions().len() == 1 }).await);

        // Several balancing rounds later the host still holds one lease.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(a.running_partitions().len(), 1);
        assert_eq!(fleet.owned_by("a").await, 1);

        a.stop().await.unwrap();
    }
}
