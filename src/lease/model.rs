//! The lease entity.

use crate::error::{Error, Result};
use crate::store::StoredItem;
use crate::types::{continuation_offset, FeedRange, PartitionId, PartitionKeyRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Ownership and progress record for one source partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Record id in the lease container.
    pub id: String,

    /// Partition this lease covers.
    pub lease_token: PartitionId,

    /// Keys served by the partition.
    pub feed_range: FeedRange,

    /// Host currently holding the lease.
    pub owner: Option<String>,

    /// Position of the last checkpoint.
    pub continuation_token: Option<String>,

    /// Last successful mutation (UNIX millis).
    pub timestamp_ms: u64,

    /// User properties carried across acquisitions.
    pub properties: BTreeMap<String, String>,

    /// Concurrency token of the stored copy; assigned by the store.
    #[serde(skip)]
    pub concurrency_token: Option<String>,
}

impl Lease {
    /// Create an unowned lease for a partition.
    pub fn new(id_prefix: &str, range: &PartitionKeyRange) -> Self {
        Self {
            id: format!("{}{}", id_prefix, range.id),
            lease_token: range.id.clone(),
            feed_range: range.range.clone(),
            owner: None,
            continuation_token: None,
            timestamp_ms: 0,
            properties: BTreeMap::new(),
            concurrency_token: None,
        }
    }

    /// Seed the lease with a continuation.
    pub fn with_continuation(mut self, continuation: Option<String>) -> Self {
        self.continuation_token = continuation;
        self
    }

    /// Set the owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set the last-updated timestamp.
    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Check whether `host` holds the lease.
    pub fn is_owned_by(&self, host: &str) -> bool {
        self.owner.as_deref() == Some(host)
    }

    /// Check whether the lease is free to take: unowned, or not renewed in time.
    pub fn is_expired(&self, now_ms: u64, expiration: Duration) -> bool {
        match self.owner {
            None => true,
            Some(_) => now_ms.saturating_sub(self.timestamp_ms) > expiration.as_millis() as u64,
        }
    }

    /// Offset of the last checkpoint, when the token is offset-based.
    pub fn checkpoint_offset(&self) -> Option<u64> {
        self.continuation_token.as_deref().and_then(continuation_offset)
    }

    /// Encode into a store record.
    pub fn to_item(&self) -> Result<StoredItem> {
        let body = bincode::serialize(self)?;
        let mut item = StoredItem::new(self.id.clone(), body);
        item.etag = self.concurrency_token.clone();
        Ok(item)
    }

    /// Decode from a store record.
    pub fn from_item(item: &StoredItem) -> Result<Self> {
        let mut lease: Lease = bincode::deserialize(&item.body)?;
        if lease.id != item.id {
            return Err(Error::Internal(format!(
                "lease record {} carries id {}",
                item.id, lease.id
            )));
        }
        lease.concurrency_token = item.etag.clone();
        Ok(lease)
    }
}

impl std::fmt::Display for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} owner={} continuation={}",
            self.lease_token,
            self.owner.as_deref().unwrap_or("<none>"),
            self.continuation_token.as_deref().unwrap_or("<none>")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(id: &str) -> PartitionKeyRange {
        PartitionKeyRange::new(id, FeedRange::full())
    }

    #[test]
    fn test_new_lease() {
        let lease = Lease::new("orders..", &range("0"));
        assert_eq!(lease.id, "orders..0");
        assert_eq!(lease.lease_token, "0");
        assert!(lease.owner.is_none());
        assert!(lease.continuation_token.is_none());
    }

    #[test]
    fn test_item_encoding_keeps_etag_out_of_body() {
        let mut lease = Lease::new("..", &range("1"))
            .with_owner("host-a")
            .with_continuation(Some("17".into()));
        lease.concurrency_token = Some("etag-1".into());
        lease.properties.insert("region".into(), "west".into());

        let item = lease.to_item().unwrap();
        assert_eq!(item.id, "..1");
        assert_eq!(item.etag.as_deref(), Some("etag-1"));

        let decoded = Lease::from_item(&StoredItem::new(item.id.clone(), item.body.clone())).unwrap();
        assert!(decoded.concurrency_token.is_none());
        assert_eq!(decoded.owner.as_deref(), Some("host-a"));
        assert_eq!(decoded.checkpoint_offset(), Some(17));
        assert_eq!(decoded.properties.get("region").map(String::as_str), Some("west"));

        let with_etag = Lease::from_item(&item).unwrap();
        assert_eq!(with_etag, lease);
    }

    #[test]
    fn test_expiry() {
        let expiration = Duration::from_secs(60);

        let unowned = Lease::new("..", &range("0")).with_timestamp(1_000_000);
        assert!(unowned.is_expired(1_000_000, expiration));

        let fresh = Lease::new("..", &range("0"))
            .with_owner("a")
            .with_timestamp(1_000_000);
        assert!(!fresh.is_expired(1_030_000, expiration));
        assert!(fresh.is_expired(1_060_001, expiration));
        assert!(fresh.is_owned_by("a"));
        assert!(!fresh.is_owned_by("b"));
    }
}
