//! Lease ownership operations for one host.

use crate::error::{Error, LeaseLostReason, Result, StoreError};
use crate::lease::{Lease, LeaseUpdater};
use crate::store::ItemStore;
use crate::types::{continuation_offset, now_ms, PartitionKeyRange};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reads and mutates leases on behalf of `host_name`.
///
/// Every mutation goes through the [`LeaseUpdater`] and re-checks ownership
/// against the server copy, so a host that lost a lease to another host gets
/// `LeaseLost` instead of overwriting the new owner's state.
#[derive(Debug)]
pub struct LeaseManager {
    host_name: String,
    container: Arc<dyn ItemStore>,
    updater: LeaseUpdater,
    lease_id_prefix: String,
}

impl LeaseManager {
    /// Create a lease manager.
    pub fn new(host_name: impl Into<String>, container: Arc<dyn ItemStore>, lease_id_prefix: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            updater: LeaseUpdater::new(container.clone()),
            container,
            lease_id_prefix: lease_id_prefix.into(),
        }
    }

    /// Name of the host this manager acts for.
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// All leases in the container, ordered by lease token.
    pub async fn list_all_leases(&self) -> Result<Vec<Lease>> {
        let items = self.container.read_items_with_prefix(&self.lease_id_prefix).await?;
        let mut leases = items.iter().map(Lease::from_item).collect::<Result<Vec<_>>>()?;
        leases.sort_by(|a, b| a.lease_token.cmp(&b.lease_token));
        Ok(leases)
    }

    /// Leases currently owned by this host.
    pub async fn list_owned_leases(&self) -> Result<Vec<Lease>> {
        let leases = self.list_all_leases().await?;
        Ok(leases
            .into_iter()
            .filter(|l| l.is_owned_by(&self.host_name))
            .collect())
    }

    /// Create an unowned lease for `range` unless one already exists.
    ///
    /// Returns `None` when another host created it first.
    pub async fn create_lease_if_not_exists(
        &self,
        range: &PartitionKeyRange,
        continuation: Option<String>,
    ) -> Result<Option<Lease>> {
        let lease = Lease::new(&self.lease_id_prefix, range)
            .with_continuation(continuation)
            .with_timestamp(now_ms());

        match self.container.create_item(lease.to_item()?).await {
            Ok(created) => {
                info!(
                    lease_token = %lease.lease_token,
                    range = %lease.feed_range,
                    continuation = ?lease.continuation_token,
                    "Created lease"
                );
                Ok(Some(Lease::from_item(&created)?))
            }
            Err(StoreError::Conflict(_)) => {
                debug!(lease_token = %lease.lease_token, "Lease already exists");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take ownership of `lease`.
    ///
    /// Fails with `LeaseLost` if the owner changed since `lease` was read.
    pub async fn acquire(&self, lease: &Lease) -> Result<Lease> {
        let expected_owner = lease.owner.clone();
        let host = self.host_name.clone();
        let properties = lease.properties.clone();

        let acquired = self
            .updater
            .update_lease(lease.clone(), &lease.id, move |mut server| {
                if server.owner != expected_owner {
                    return Err(Error::lease_lost(&server, LeaseLostReason::OwnerChanged));
                }
                server.owner = Some(host.clone());
                server.properties = properties.clone();
                Ok(Some(server))
            })
            .await?;

        let acquired = Self::persisted(lease, acquired)?;
        info!(
            lease_token = %acquired.lease_token,
            previous_owner = ?lease.owner,
            host = %self.host_name,
            "Acquired lease"
        );
        Ok(acquired)
    }

    /// Refresh the timestamp of a lease owned by this host.
    pub async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let host = self.host_name.clone();
        let renewed = self
            .updater
            .update_lease(lease.clone(), &lease.id, move |server| {
                if !server.is_owned_by(&host) {
                    return Err(Error::lease_lost(&server, LeaseLostReason::OwnerChanged));
                }
                Ok(Some(server))
            })
            .await?;

        let renewed = Self::persisted(lease, renewed)?;
        debug!(lease_token = %renewed.lease_token, "Renewed lease");
        Ok(renewed)
    }

    /// Give up ownership of a lease owned by this host.
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        let host = self.host_name.clone();
        self.updater
            .update_lease(lease.clone(), &lease.id, move |mut server| {
                if !server.is_owned_by(&host) {
                    return Err(Error::lease_lost(&server, LeaseLostReason::OwnerChanged));
                }
                server.owner = None;
                Ok(Some(server))
            })
            .await?;

        info!(lease_token = %lease.lease_token, host = %self.host_name, "Released lease");
        Ok(())
    }

    /// Persist the user properties of a lease owned by this host.
    pub async fn update_properties(&self, lease: &Lease) -> Result<Lease> {
        if !lease.is_owned_by(&self.host_name) {
            return Err(Error::lease_lost(lease, LeaseLostReason::OwnerChanged));
        }

        let host = self.host_name.clone();
        let properties = lease.properties.clone();
        let updated = self
            .updater
            .update_lease(lease.clone(), &lease.id, move |mut server| {
                if !server.is_owned_by(&host) {
                    return Err(Error::lease_lost(&server, LeaseLostReason::OwnerChanged));
                }
                server.properties = properties.clone();
                Ok(Some(server))
            })
            .await?;

        Self::persisted(lease, updated)
    }

    /// Record `continuation` as the processed position of a lease owned by this host.
    ///
    /// An offset lower than the stored one is ignored and the stored lease is
    /// returned unchanged.
    pub async fn checkpoint(&self, lease: &Lease, continuation: &str) -> Result<Lease> {
        let host = self.host_name.clone();
        let token = continuation.to_string();
        let new_offset = continuation_offset(continuation);
        let mut rewind_of: Option<Lease> = None;

        let result = self
            .updater
            .update_lease(lease.clone(), &lease.id, |mut server| {
                if !server.is_owned_by(&host) {
                    return Err(Error::lease_lost(&server, LeaseLostReason::OwnerChanged));
                }
                if let (Some(new), Some(current)) = (new_offset, server.checkpoint_offset()) {
                    if new < current {
                        rewind_of = Some(server);
                        return Ok(None);
                    }
                }
                server.continuation_token = Some(token.clone());
                Ok(Some(server))
            })
            .await?;

        match result {
            Some(updated) => {
                debug!(
                    lease_token = %updated.lease_token,
                    continuation = %continuation,
                    "Checkpointed lease"
                );
                Ok(updated)
            }
            None => {
                let current = rewind_of.unwrap_or_else(|| lease.clone());
                warn!(
                    lease_token = %lease.lease_token,
                    continuation = %continuation,
                    stored = ?current.continuation_token,
                    "Ignoring checkpoint behind the stored position"
                );
                Ok(current)
            }
        }
    }

    /// Delete a lease. A lease that is already gone counts as deleted.
    pub async fn delete(&self, lease: &Lease) -> Result<()> {
        match self.container.delete_item(&lease.id, None).await {
            Ok(()) => {
                info!(lease_token = %lease.lease_token, "Deleted lease");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn persisted(original: &Lease, updated: Option<Lease>) -> Result<Lease> {
        updated.ok_or_else(|| {
            Error::Internal(format!(
                "lease update for {} produced no lease",
                original.lease_token
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryItemStore;
    use crate::types::FeedRange;

    fn range(id: &str) -> PartitionKeyRange {
        PartitionKeyRange::new(id, FeedRange::full())
    }

    fn manager(host: &str, container: &Arc<InMemoryItemStore>) -> LeaseManager {
        LeaseManager::new(host, container.clone(), "..")
    }

    #[tokio::test]
    async fn test_create_lease_if_not_exists() {
        let container = Arc::new(InMemoryItemStore::new());
        let a = manager("a", &container);

        let created = a.create_lease_if_not_exists(&range("0"), None).await.unwrap();
        assert!(created.is_some());
        let again = a.create_lease_if_not_exists(&range("0"), None).await.unwrap();
        assert!(again.is_none());

        // Control records are not leases.
        container.create_item(crate::store::StoredItem::new(".info", Vec::new())).await.unwrap();
        assert_eq!(a.list_all_leases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let container = Arc::new(InMemoryItemStore::new());
        let a = manager("a", &container);

        let lease = a.create_lease_if_not_exists(&range("0"), None).await.unwrap().unwrap();
        let owned = a.acquire(&lease).await.unwrap();
        assert!(owned.is_owned_by("a"));
        assert_eq!(a.list_owned_leases().await.unwrap().len(), 1);

        a.release(&owned).await.unwrap();
        assert!(a.list_owned_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_fails_if_owner_changed() {
        let container = Arc::new(InMemoryItemStore::new());
        let a = manager("a", &container);
        let b = manager("b", &container);

        let lease = a.create_lease_if_not_exists(&range("0"), None).await.unwrap().unwrap();
        b.acquire(&lease).await.unwrap();

        // a still believes the lease is unowned.
        let err = a.acquire(&lease).await.unwrap_err();
        assert!(err.is_lease_lost());
    }

    #[tokio::test]
    async fn test_stolen_lease_cannot_be_renewed_or_checkpointed() {
        let container = Arc::new(InMemoryItemStore::new());
        let a = manager("a", &container);
        let b = manager("b", &container);

        let lease = a.create_lease_if_not_exists(&range("0"), None).await.unwrap().unwrap();
        let owned_by_a = a.acquire(&lease).await.unwrap();
        b.acquire(&owned_by_a).await.unwrap();

        assert!(a.renew(&owned_by_a).await.unwrap_err().is_lease_lost());
        assert!(a.checkpoint(&owned_by_a, "5").await.unwrap_err().is_lease_lost());
        assert!(a.release(&owned_by_a).await.unwrap_err().is_lease_lost());
    }

    #[tokio::test]
    async fn test_checkpoint_never_rewinds() {
        let container = Arc::new(InMemoryItemStore::new());
        let a = manager("a", &container);

        let lease = a.create_lease_if_not_exists(&range("0"), None).await.unwrap().unwrap();
        let owned = a.acquire(&lease).await.unwrap();

        let at_10 = a.checkpoint(&owned, "10").await.unwrap();
        assert_eq!(at_10.continuation_token.as_deref(), Some("10"));

        let still_10 = a.checkpoint(&at_10, "4").await.unwrap();
        assert_eq!(still_10.continuation_token.as_deref(), Some("10"));

        let at_12 = a.checkpoint(&still_10, "12").await.unwrap();
        assert_eq!(at_12.continuation_token.as_deref(), Some("12"));
    }

    #[tokio::test]
    async fn test_update_properties_requires_ownership() {
        let container = Arc::new(InMemoryItemStore::new());
        let a = manager("a", &container);

        let mut lease = a.create_lease_if_not_exists(&range("0"), None).await.unwrap().unwrap();
        assert!(a.update_properties(&lease).await.unwrap_err().is_lease_lost());

        lease = a.acquire(&lease).await.unwrap();
        lease.properties.insert("k".into(), "v".into());
        let updated = a.update_properties(&lease).await.unwrap();
        assert_eq!(updated.properties.get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let container = Arc::new(InMemoryItemStore::new());
        let a = manager("a", &container);

        let lease = a.create_lease_if_not_exists(&range("0"), None).await.unwrap().unwrap();
        a.delete(&lease).await.unwrap();
        a.delete(&lease).await.unwrap();
        assert!(a.list_all_leases().await.unwrap().is_empty());
    }
}
