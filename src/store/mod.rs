//! External collaborators consumed by the processor.
//!
//! The engine never talks to the network itself. It drives three
//! capabilities supplied by the host application:
//!
//! - [`ItemStore`]: create/read/replace/delete of lease and control records,
//!   with concurrency-token (ETag) guarded writes
//! - [`ChangeFeedSource`]: page-at-a-time reads of one partition's change stream
//! - [`PartitionTopology`]: the current set of source partitions
//!
//! In-memory implementations for tests live in [`crate::testing`].

use crate::config::StartFrom;
use crate::error::StoreError;
use crate::types::{ChangeRecord, FeedRange, PartitionId, PartitionKeyRange};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Result type for collaborator calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A record held by an [`ItemStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    /// Record id, unique in the container.
    pub id: String,
    /// Concurrency token assigned by the store on every write.
    pub etag: Option<String>,
    /// Time-to-live after which the store drops the record.
    pub ttl: Option<Duration>,
    /// Encoded record body.
    pub body: Bytes,
}

impl StoredItem {
    /// Create a record without TTL.
    pub fn new(id: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            etag: None,
            ttl: None,
            body: body.into(),
        }
    }

    /// Set a time-to-live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the concurrency token.
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

/// Record CRUD over the lease container.
#[async_trait]
pub trait ItemStore: Send + Sync + std::fmt::Debug {
    /// Create a record. Fails with `Conflict` if the id already exists.
    async fn create_item(&self, item: StoredItem) -> StoreResult<StoredItem>;

    /// Read a record. Fails with `NotFound` if absent.
    async fn read_item(&self, id: &str) -> StoreResult<StoredItem>;

    /// Replace a record.
    ///
    /// With `if_match` set, fails with `PreconditionFailed` when the stored
    /// concurrency token differs. Fails with `NotFound` if absent.
    async fn replace_item(&self, item: StoredItem, if_match: Option<&str>) -> StoreResult<StoredItem>;

    /// Delete a record, optionally conditioned on its concurrency token.
    async fn delete_item(&self, id: &str, if_match: Option<&str>) -> StoreResult<()>;

    /// Read every record whose id starts with `prefix`.
    async fn read_items_with_prefix(&self, prefix: &str) -> StoreResult<Vec<StoredItem>>;
}

/// A request for one page of a partition's change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRequest {
    pub partition_id: PartitionId,
    pub start: StartFrom,
    pub max_item_count: usize,
}

/// One page of changes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeedPage {
    /// Changes in stream order.
    pub records: Vec<ChangeRecord>,
    /// Token resuming right after the last change of this page.
    pub continuation: String,
    /// Latest offset written to the partition when the page was served.
    pub latest_offset: Option<u64>,
}

impl FeedPage {
    /// Check whether the page carries any changes.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Page-at-a-time access to partition change streams.
///
/// Must report `PartitionGone`, `PartitionSplit`, `PageTooLarge` and
/// `Throttled` distinctly from other failures.
#[async_trait]
pub trait ChangeFeedSource: Send + Sync + std::fmt::Debug {
    /// Read the next page.
    async fn read_page(&self, request: &FeedRequest) -> StoreResult<FeedPage>;
}

/// Current partitioning of the source.
#[async_trait]
pub trait PartitionTopology: Send + Sync + std::fmt::Debug {
    /// All live partitions.
    async fn list_ranges(&self) -> StoreResult<Vec<PartitionKeyRange>>;

    /// Live partitions overlapping `range`.
    async fn overlapping_ranges(&self, range: &FeedRange) -> StoreResult<Vec<PartitionKeyRange>> {
        let ranges = self.list_ranges().await?;
        Ok(ranges
            .into_iter()
            .filter(|r| r.range.overlaps(range))
            .collect())
    }
}
