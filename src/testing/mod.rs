//! Testing utilities for the change feed processor.
//!
//! In-memory implementations of the collaborator traits, so whole fleets of
//! hosts can run inside one test process:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Test process                              │
//! │                                                                 │
//! │   host "a"          host "b"          host "c"                  │
//! │      │                 │                 │                      │
//! │      └────────┬────────┴────────┬────────┘                      │
//! │               ▼                 ▼                               │
//! │   ┌─────────────────────┐  ┌──────────────────────────────┐     │
//! │   │  InMemoryItemStore  │  │  InMemoryChangeFeed          │     │
//! │   │  ETags, TTL,        │  │  partitions, appends,        │     │
//! │   │  fault injection    │  │  splits, fault injection     │     │
//! │   └─────────────────────┘  └──────────────────────────────┘     │
//! │                                                                 │
//! │   RecordingObserverFactory → ObserverLog (shared by all hosts)  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use changefeed_processor::testing::{InMemoryChangeFeed, InMemoryItemStore, RecordingObserverFactory};
//!
//! let feed = Arc::new(InMemoryChangeFeed::with_partitions(4));
//! let leases = Arc::new(InMemoryItemStore::new());
//! let observers = RecordingObserverFactory::new();
//!
//! feed.append_many("0", 10)?;
//! feed.split_in_two("0", "4", "5", "20")?;
//! ```

mod memory_feed;
mod memory_store;
mod observers;

mod balancing_tests;
mod bootstrap_tests;

pub use memory_feed::InMemoryChangeFeed;
pub use memory_store::InMemoryItemStore;
pub use observers::{ObserverEvent, ObserverLog, RecordingObserver, RecordingObserverFactory};

use std::future::Future;
use std::time::Duration;

/// Poll `check` until it returns `true` or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn eventually<F, Fut>(timeout: Duration, check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_eventually_met() {
        let calls = Arc::new(AtomicUsize::new(0));
        let met = eventually(Duration::from_secs(1), || {
            let calls = calls.clone();
            async move { calls.fetch_add(1, Ordering::SeqCst) >= 2 }
        })
        .await;
        assert!(met);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventually_times_out() {
        assert!(!eventually(Duration::from_millis(100), || async { false }).await);
    }
}
