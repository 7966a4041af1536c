//! Bootstrap scenarios with several hosts sharing one lease container.
//!
//! | Scenario                 | Verification                                   |
//! |--------------------------|------------------------------------------------|
//! | Concurrent hosts         | one lease per partition, marker written once   |
//! | Lock holder crashes      | lock expires, another host completes the work  |
//! | Interrupted bootstrap    | missing leases added, existing ones untouched  |

#[cfg(test)]
mod tests {
    use crate::bootstrap::Bootstrapper;
    use crate::lease::{LeaseManager, LeaseStore};
    use crate::processing::PartitionSynchronizer;
    use crate::testing::{InMemoryChangeFeed, InMemoryItemStore};
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;
    use tokio_util::sync::CancellationToken;

    const PREFIX: &str = "app..";
    const MARKER: &str = "app.info";
    const LOCK: &str = "app.lock";

    fn host(
        name: &str,
        container: &Arc<InMemoryItemStore>,
        feed: &Arc<InMemoryChangeFeed>,
        lock_duration: Duration,
    ) -> Bootstrapper {
        let manager = Arc::new(LeaseManager::new(name, container.clone(), PREFIX));
        let synchronizer = Arc::new(PartitionSynchronizer::new(feed.clone(), manager));
        let store = Arc::new(LeaseStore::new(container.clone(), MARKER, LOCK));
        Bootstrapper::new(synchronizer, store, lock_duration, Duration::from_millis(10))
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_concurrent_hosts_create_one_lease_set() {
        let container = Arc::new(InMemoryItemStore::new());
        let feed = Arc::new(InMemoryChangeFeed::with_partitions(4));

        let hosts: Vec<Bootstrapper> = ["a", "b", "c"]
            .iter()
            .map(|name| host(name, &container, &feed, Duration::from_secs(30)))
            .collect();
        let cancel = CancellationToken::new();

        let results = futures::future::join_all(hosts.iter().map(|h| h.initialize(&cancel))).await;
        assert!(results.iter().all(|r| r.is_ok()), "{results:?}");

        assert_eq!(
            container.ids(),
            vec!["app..0", "app..1", "app..2", "app..3", "app.info"]
        );

        let leases = LeaseManager::new("reader", container.clone(), PREFIX)
            .list_all_leases()
            .await
            .unwrap();
        assert_eq!(leases.len(), 4);
        assert!(leases.iter().all(|l| l.owner.is_none() && l.continuation_token.is_none()));
    }

    #[test(tokio::test)]
    async fn test_expired_lock_is_taken_over() {
        let container = Arc::new(InMemoryItemStore::new());
        let feed = Arc::new(InMemoryChangeFeed::with_partitions(2));

        // A host took the lock and died before writing anything.
        let crashed = LeaseStore::new(container.clone(), MARKER, LOCK);
        assert!(crashed
            .acquire_initialization_lock(Duration::from_millis(100))
            .await
            .unwrap());

        let survivor = host("b", &container, &feed, Duration::from_secs(30));
        tokio::time::timeout(Duration::from_secs(5), survivor.initialize(&CancellationToken::new()))
            .await
            .expect("bootstrap did not finish after the lock expired")
            .unwrap();

        assert_eq!(container.ids(), vec!["app..0", "app..1", "app.info"]);
    }

    #[test(tokio::test)]
    async fn test_interrupted_bootstrap_is_completed() {
        let container = Arc::new(InMemoryItemStore::new());
        let feed = Arc::new(InMemoryChangeFeed::with_partitions(3));

        // A previous attempt created one lease, which has since made progress.
        let manager = LeaseManager::new("a", container.clone(), PREFIX);
        let ranges = crate::store::PartitionTopology::list_ranges(feed.as_ref()).await.unwrap();
        manager
            .create_lease_if_not_exists(&ranges[1], Some("42".into()))
            .await
            .unwrap();

        host("b", &container, &feed, Duration::from_secs(30))
            .initialize(&CancellationToken::new())
            .await
            .unwrap();

        let leases = manager.list_all_leases().await.unwrap();
        let tokens: Vec<&str> = leases.iter().map(|l| l.lease_token.as_str()).collect();
        assert_eq!(tokens, vec!["0", "1", "2"]);
        assert_eq!(leases[1].continuation_token.as_deref(), Some("42"));
        assert!(leases[0].continuation_token.is_none());
    }
}
