//! Core types used throughout the change feed processor.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Partition key range identifier.
pub type PartitionId = String;

/// Lowest effective partition key.
pub const MIN_EFFECTIVE_KEY: &str = "";

/// Upper bound (exclusive) of the effective partition key space.
pub const MAX_EFFECTIVE_KEY: &str = "FF";

/// A half-open range `[min_inclusive, max_exclusive)` of effective partition keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedRange {
    pub min_inclusive: String,
    pub max_exclusive: String,
}

impl FeedRange {
    /// Create a new range.
    pub fn new(min_inclusive: impl Into<String>, max_exclusive: impl Into<String>) -> Self {
        Self {
            min_inclusive: min_inclusive.into(),
            max_exclusive: max_exclusive.into(),
        }
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::new(MIN_EFFECTIVE_KEY, MAX_EFFECTIVE_KEY)
    }

    /// Check whether the range contains no keys.
    pub fn is_empty(&self) -> bool {
        self.min_inclusive >= self.max_exclusive
    }

    /// Check whether two ranges share at least one key.
    pub fn overlaps(&self, other: &FeedRange) -> bool {
        self.min_inclusive < other.max_exclusive && other.min_inclusive < self.max_exclusive
    }

    /// Check whether `other` lies entirely inside this range.
    pub fn contains(&self, other: &FeedRange) -> bool {
        self.min_inclusive <= other.min_inclusive && other.max_exclusive <= self.max_exclusive
    }

    /// Check whether `parts` tile this range exactly: disjoint, no gaps, same bounds.
    pub fn is_tiled_by(&self, parts: &[FeedRange]) -> bool {
        if parts.is_empty() || parts.iter().any(FeedRange::is_empty) {
            return false;
        }

        let mut sorted: Vec<&FeedRange> = parts.iter().collect();
        sorted.sort();

        if sorted[0].min_inclusive != self.min_inclusive {
            return false;
        }
        for pair in sorted.windows(2) {
            if pair[0].max_exclusive != pair[1].min_inclusive {
                return false;
            }
        }
        sorted[sorted.len() - 1].max_exclusive == self.max_exclusive
    }
}

impl std::fmt::Display for FeedRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.min_inclusive, self.max_exclusive)
    }
}

/// A physical partition of the source as reported by the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionKeyRange {
    /// Partition identifier.
    pub id: PartitionId,
    /// Keys served by this partition.
    pub range: FeedRange,
    /// Ancestors this partition was split from, oldest first.
    pub parents: Vec<PartitionId>,
}

impl PartitionKeyRange {
    /// Create a partition with no parents.
    pub fn new(id: impl Into<PartitionId>, range: FeedRange) -> Self {
        Self {
            id: id.into(),
            range,
            parents: Vec::new(),
        }
    }

    /// Set the ancestry of this partition.
    pub fn with_parents(mut self, parents: Vec<PartitionId>) -> Self {
        self.parents = parents;
        self
    }
}

/// A single change read from the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Document identifier.
    pub id: String,
    /// Position of this change in its partition's stream.
    pub offset: u64,
    /// Document body.
    pub payload: Bytes,
}

impl ChangeRecord {
    /// Create a new change record.
    pub fn new(id: impl Into<String>, offset: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            offset,
            payload: payload.into(),
        }
    }
}

/// Parse a continuation token as a stream offset.
///
/// Tokens produced by offset-based feeds are decimal offsets, optionally quoted.
pub fn continuation_offset(token: &str) -> Option<u64> {
    token.trim_matches('"').parse().ok()
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
