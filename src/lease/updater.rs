//! Optimistic-concurrency lease mutation.

use crate::error::{Error, LeaseLostReason, Result, StoreError};
use crate::lease::Lease;
use crate::store::ItemStore;
use crate::types::now_ms;
use std::sync::Arc;
use tracing::{debug, warn};

/// Attempts made before a contended update gives up.
pub const RETRY_COUNT_ON_CONFLICT: usize = 5;

/// Applies lease transformations with concurrency-token guarded replaces.
///
/// Every write presents the token of the copy the transformation was applied
/// to. On a stale token the server copy is re-read and the transformation is
/// applied again, up to [`RETRY_COUNT_ON_CONFLICT`] times.
#[derive(Debug, Clone)]
pub struct LeaseUpdater {
    container: Arc<dyn ItemStore>,
}

impl LeaseUpdater {
    /// Create an updater over `container`.
    pub fn new(container: Arc<dyn ItemStore>) -> Self {
        Self { container }
    }

    /// Apply `update_fn` to `cached_lease` and persist the result.
    ///
    /// `update_fn` returns `Ok(None)` when there is nothing to write, which
    /// ends the update as a no-op. Errors from `update_fn` abort the update.
    pub async fn update_lease<F>(&self, cached_lease: Lease, item_id: &str, mut update_fn: F) -> Result<Option<Lease>>
    where
        F: FnMut(Lease) -> Result<Option<Lease>> + Send,
    {
        let mut lease = cached_lease;

        for attempt in 1..=RETRY_COUNT_ON_CONFLICT {
            let Some(mut updated) = update_fn(lease.clone())? else {
                return Ok(None);
            };
            updated.timestamp_ms = now_ms();

            let if_match = lease.concurrency_token.clone();
            let item = updated.to_item()?;

            match self.container.replace_item(item, if_match.as_deref()).await {
                Ok(stored) => {
                    let persisted = Lease::from_item(&stored)?;
                    debug!(
                        lease_token = %persisted.lease_token,
                        owner = ?persisted.owner,
                        "Lease updated"
                    );
                    return Ok(Some(persisted));
                }
                Err(StoreError::PreconditionFailed(_)) => {
                    debug!(
                        lease_token = %lease.lease_token,
                        attempt,
                        "Lease changed concurrently, re-reading server copy"
                    );
                    lease = self.read_server_lease(&lease, item_id).await?;
                }
                Err(StoreError::Conflict(_)) => {
                    warn!(lease_token = %lease.lease_token, "Lease update conflict");
                    return Err(Error::lease_lost(&lease, LeaseLostReason::Conflict));
                }
                Err(StoreError::NotFound(_)) => {
                    warn!(lease_token = %lease.lease_token, "Lease deleted while updating");
                    return Err(Error::lease_lost(&lease, LeaseLostReason::Deleted));
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            lease_token = %lease.lease_token,
            retries = RETRY_COUNT_ON_CONFLICT,
            "Lease update retries exhausted"
        );
        Err(Error::LeaseLost {
            lease_token: lease.lease_token.clone(),
            reason: LeaseLostReason::RetriesExhausted,
            server_lease: Some(Box::new(lease)),
        })
    }

    async fn read_server_lease(&self, lease: &Lease, item_id: &str) -> Result<Lease> {
        match self.container.read_item(item_id).await {
            Ok(item) => Lease::from_item(&item),
            Err(StoreError::NotFound(_)) => Err(Error::lease_lost(lease, LeaseLostReason::Deleted)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryItemStore;
    use crate::types::{FeedRange, PartitionKeyRange};

    async fn seeded(container: &Arc<InMemoryItemStore>) -> Lease {
        let lease = Lease::new("..", &PartitionKeyRange::new("0", FeedRange::full())).with_owner("a");
        let created = container.create_item(lease.to_item().unwrap()).await.unwrap();
        Lease::from_item(&created).unwrap()
    }

    fn set_continuation(token: &'static str) -> impl FnMut(Lease) -> Result<Option<Lease>> + Send {
        move |mut lease| {
            lease.continuation_token = Some(token.to_string());
            Ok(Some(lease))
        }
    }

    #[tokio::test]
    async fn test_update_stamps_and_advances_token() {
        let container = Arc::new(InMemoryItemStore::new());
        let updater = LeaseUpdater::new(container.clone());
        let lease = seeded(&container).await;

        let updated = updater
            .update_lease(lease.clone(), &lease.id, set_continuation("5"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.continuation_token.as_deref(), Some("5"));
        assert!(updated.timestamp_ms > 0);
        assert_ne!(updated.concurrency_token, lease.concurrency_token);
    }

    #[tokio::test]
    async fn test_none_is_a_noop() {
        let container = Arc::new(InMemoryItemStore::new());
        let updater = LeaseUpdater::new(container.clone());
        let lease = seeded(&container).await;
        let writes = container.write_count();

        let result = updater.update_lease(lease.clone(), &lease.id, |_| Ok(None)).await.unwrap();
        assert!(result.is_none());
        assert_eq!(container.write_count(), writes);
    }

    #[tokio::test]
    async fn test_stale_token_rereads_and_retries() {
        let container = Arc::new(InMemoryItemStore::new());
        let updater = LeaseUpdater::new(container.clone());
        let stale = seeded(&container).await;

        // Another writer moves the lease forward.
        let winner = updater
            .update_lease(stale.clone(), &stale.id, set_continuation("10"))
            .await
            .unwrap()
            .unwrap();

        let mut seen = Vec::new();
        let updated = updater
            .update_lease(stale.clone(), &stale.id, |mut lease| {
                seen.push(lease.continuation_token.clone());
                lease.properties.insert("touched".into(), "yes".into());
                Ok(Some(lease))
            })
            .await
            .unwrap()
            .unwrap();

        // First attempt ran on the stale copy, the retry on the winner's copy.
        assert_eq!(seen, vec![None, Some("10".to_string())]);
        assert_eq!(updated.continuation_token.as_deref(), Some("10"));
        assert_ne!(updated.concurrency_token, winner.concurrency_token);
    }

    #[tokio::test]
    async fn test_deleted_lease_is_lost() {
        let container = Arc::new(InMemoryItemStore::new());
        let updater = LeaseUpdater::new(container.clone());
        let lease = seeded(&container).await;
        container.delete_item(&lease.id, None).await.unwrap();

        let err = updater
            .update_lease(lease.clone(), &lease.id, set_continuation("1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::LeaseLost {
                reason: LeaseLostReason::Deleted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_conflict_is_lost_without_retry() {
        let container = Arc::new(InMemoryItemStore::new());
        let updater = LeaseUpdater::new(container.clone());
        let lease = seeded(&container).await;

        container.fail_next_write(StoreError::Conflict("committed elsewhere".into()));
        let err = updater
            .update_lease(lease.clone(), &lease.id, set_continuation("1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::LeaseLost {
                reason: LeaseLostReason::Conflict,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_retries_exhausted_carries_server_copy() {
        let container = Arc::new(InMemoryItemStore::new());
        let updater = LeaseUpdater::new(container.clone());
        let lease = seeded(&container).await;

        for _ in 0..RETRY_COUNT_ON_CONFLICT {
            container.fail_next_write(StoreError::PreconditionFailed("stale".into()));
        }

        let mut calls = 0;
        let err = updater
            .update_lease(lease.clone(), &lease.id, |l| {
                calls += 1;
                Ok(Some(l))
            })
            .await
            .unwrap_err();

        assert_eq!(calls, RETRY_COUNT_ON_CONFLICT);
        match err {
            Error::LeaseLost {
                reason: LeaseLostReason::RetriesExhausted,
                server_lease: Some(server),
                ..
            } => assert_eq!(server.lease_token, "0"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_fn_error_aborts() {
        let container = Arc::new(InMemoryItemStore::new());
        let updater = LeaseUpdater::new(container.clone());
        let lease = seeded(&container).await;

        let err = updater
            .update_lease(lease.clone(), &lease.id, |l| {
                Err(Error::lease_lost(&l, LeaseLostReason::OwnerChanged))
            })
            .await
            .unwrap_err();
        assert!(err.is_lease_lost());
    }
}
