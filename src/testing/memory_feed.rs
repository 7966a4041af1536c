//! In-memory partitioned change feed with split support.

use crate::config::StartFrom;
use crate::error::StoreError;
use crate::store::{ChangeFeedSource, FeedPage, FeedRequest, PartitionTopology, StoreResult};
use crate::types::{
    continuation_offset, now_ms, ChangeRecord, FeedRange, PartitionId, PartitionKeyRange,
    MAX_EFFECTIVE_KEY, MIN_EFFECTIVE_KEY,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
struct LoggedRecord {
    written_at_ms: u64,
    record: ChangeRecord,
}

#[derive(Debug)]
struct PartitionLog {
    range: PartitionKeyRange,
    records: Vec<LoggedRecord>,
    /// Last offset handed out in this partition or the partition it split from.
    next_offset: u64,
}

impl PartitionLog {
    fn latest_offset(&self) -> Option<u64> {
        self.records.last().map(|r| r.record.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retired {
    Split,
    Gone,
}

#[derive(Debug, Default)]
struct FeedState {
    live: BTreeMap<PartitionId, PartitionLog>,
    retired: HashMap<PartitionId, Retired>,
}

/// [`ChangeFeedSource`] and [`PartitionTopology`] over in-memory logs.
///
/// Every partition numbers its changes densely from 1. A child partition
/// created by [`split`] continues its parent's numbering, so it can resume
/// from the parent's continuation. Continuations are decimal offsets of the
/// last record returned.
///
/// [`split`]: InMemoryChangeFeed::split
#[derive(Debug, Default)]
pub struct InMemoryChangeFeed {
    state: Mutex<FeedState>,
    read_failures: Mutex<HashMap<PartitionId, VecDeque<StoreError>>>,
    topology_failures: Mutex<VecDeque<StoreError>>,
    max_page_size: Mutex<Option<usize>>,
    reads: AtomicU64,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// A feed with `count` partitions, ids `"0"..`, evenly tiling the key space.
    ///
    /// `count` must be between 1 and 128.
    pub fn with_partitions(count: usize) -> Self {
        let feed = Self::new();
        let count = count.clamp(1, 128);
        let boundary = |i: usize| -> String {
            if i == 0 {
                MIN_EFFECTIVE_KEY.to_string()
            } else if i == count {
                MAX_EFFECTIVE_KEY.to_string()
            } else {
                format!("{:02X}", i * 256 / count)
            }
        };
        for i in 0..count {
            feed.add_partition(PartitionKeyRange::new(
                i.to_string(),
                FeedRange::new(boundary(i), boundary(i + 1)),
            ));
        }
        feed
    }

    /// Add a live partition.
    pub fn add_partition(&self, range: PartitionKeyRange) {
        let mut state = self.state.lock();
        state.retired.remove(&range.id);
        state.live.insert(
            range.id.clone(),
            PartitionLog {
                range,
                records: Vec::new(),
                next_offset: 0,
            },
        );
    }

    /// Remove a partition without replacement. Reads fail with `PartitionGone`.
    pub fn remove_partition(&self, partition_id: &str) {
        let mut state = self.state.lock();
        if state.live.remove(partition_id).is_some() {
            state.retired.insert(partition_id.to_string(), Retired::Gone);
        }
    }

    /// Append a change to a live partition and return its offset.
    pub fn append(&self, partition_id: &str, id: impl Into<String>, payload: impl Into<Bytes>) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let log = state
            .live
            .get_mut(partition_id)
            .ok_or_else(|| StoreError::PartitionGone(partition_id.to_string()))?;
        log.next_offset += 1;
        let offset = log.next_offset;
        log.records.push(LoggedRecord {
            written_at_ms: now_ms(),
            record: ChangeRecord::new(id, offset, payload),
        });
        Ok(offset)
    }

    /// Append `count` changes with ids `"<partition>-<n>"`. Returns the last offset.
    pub fn append_many(&self, partition_id: &str, count: usize) -> StoreResult<u64> {
        let mut last = 0;
        for n in 0..count {
            last = self.append(partition_id, format!("{partition_id}-{n}"), Bytes::new())?;
        }
        Ok(last)
    }

    /// Split `parent` into `children`, which must tile its range.
    ///
    /// The parent's history is dealt round-robin to the children, keeping
    /// offsets, so every change appears in exactly one child. Reads of the
    /// parent then fail with `PartitionSplit`.
    pub fn split(&self, parent: &str, children: Vec<(PartitionId, FeedRange)>) -> StoreResult<Vec<PartitionKeyRange>> {
        let mut state = self.state.lock();
        let log = state
            .live
            .remove(parent)
            .ok_or_else(|| StoreError::PartitionGone(parent.to_string()))?;

        let ranges: Vec<FeedRange> = children.iter().map(|(_, r)| r.clone()).collect();
        if children.is_empty() || !log.range.range.is_tiled_by(&ranges) {
            state.live.insert(parent.to_string(), log);
            return Err(StoreError::Unavailable(format!(
                "children do not tile the range of partition {parent}"
            )));
        }

        let mut lineage = log.range.parents.clone();
        lineage.push(parent.to_string());

        let mut logs: Vec<PartitionLog> = children
            .into_iter()
            .map(|(id, range)| PartitionLog {
                range: PartitionKeyRange::new(id, range).with_parents(lineage.clone()),
                records: Vec::new(),
                next_offset: log.next_offset,
            })
            .collect();
        let fanout = logs.len();
        for (i, record) in log.records.into_iter().enumerate() {
            logs[i % fanout].records.push(record);
        }

        let created: Vec<PartitionKeyRange> = logs.iter().map(|l| l.range.clone()).collect();
        for child in logs {
            state.live.insert(child.range.id.clone(), child);
        }
        state.retired.insert(parent.to_string(), Retired::Split);
        Ok(created)
    }

    /// Split `parent` in two at the midpoint of its range.
    pub fn split_in_two(&self, parent: &str, left: &str, right: &str, at: &str) -> StoreResult<Vec<PartitionKeyRange>> {
        let range = self
            .state
            .lock()
            .live
            .get(parent)
            .map(|l| l.range.range.clone())
            .ok_or_else(|| StoreError::PartitionGone(parent.to_string()))?;
        self.split(
            parent,
            vec![
                (left.to_string(), FeedRange::new(range.min_inclusive.clone(), at)),
                (right.to_string(), FeedRange::new(at, range.max_exclusive.clone())),
            ],
        )
    }

    /// Fail the next read of `partition_id` with `error`.
    pub fn fail_next_read(&self, partition_id: &str, error: StoreError) {
        self.read_failures
            .lock()
            .entry(partition_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fail the next topology listing with `error`.
    pub fn fail_next_listing(&self, error: StoreError) {
        self.topology_failures.lock().push_back(error);
    }

    /// Reject requests asking for more than `size` items with `PageTooLarge`.
    pub fn set_max_page_size(&self, size: Option<usize>) {
        *self.max_page_size.lock() = size;
    }

    /// Number of page reads served or failed.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Ids of live partitions.
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.state.lock().live.keys().cloned().collect()
    }

    fn start_offset(log: &PartitionLog, start: &StartFrom) -> StoreResult<u64> {
        match start {
            StartFrom::Beginning => Ok(0),
            StartFrom::Now => Ok(log.latest_offset().unwrap_or(0)),
            StartFrom::Time(at_ms) => Ok(log
                .records
                .iter()
                .take_while(|r| r.written_at_ms < *at_ms)
                .last()
                .map_or(0, |r| r.record.offset)),
            StartFrom::Continuation(token) => continuation_offset(token)
                .ok_or_else(|| StoreError::Serialization(format!("invalid continuation {token:?}"))),
        }
    }
}

#[async_trait]
impl ChangeFeedSource for InMemoryChangeFeed {
    async fn read_page(&self, request: &FeedRequest) -> StoreResult<FeedPage> {
        tokio::task::yield_now().await;
        self.reads.fetch_add(1, Ordering::SeqCst);

        if let Some(e) = self
            .read_failures
            .lock()
            .get_mut(&request.partition_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(e);
        }

        if let Some(limit) = *self.max_page_size.lock() {
            if request.max_item_count > limit {
                return Err(StoreError::PageTooLarge {
                    requested: request.max_item_count,
                });
            }
        }

        let state = self.state.lock();
        let Some(log) = state.live.get(&request.partition_id) else {
            return Err(match state.retired.get(&request.partition_id) {
                Some(Retired::Split) => StoreError::PartitionSplit(request.partition_id.clone()),
                _ => StoreError::PartitionGone(request.partition_id.clone()),
            });
        };

        let start = Self::start_offset(log, &request.start)?;
        let records: Vec<ChangeRecord> = log
            .records
            .iter()
            .filter(|r| r.record.offset > start)
            .take(request.max_item_count)
            .map(|r| r.record.clone())
            .collect();
        let end = records.last().map_or(start, |r| r.offset);

        Ok(FeedPage {
            records,
            continuation: end.to_string(),
            latest_offset: Some(log.latest_offset().unwrap_or(start).max(start)),
        })
    }
}

#[async_trait]
impl PartitionTopology for InMemoryChangeFeed {
    async fn list_ranges(&self) -> StoreResult<Vec<PartitionKeyRange>> {
        tokio::task::yield_now().await;
        if let Some(e) = self.topology_failures.lock().pop_front() {
            return Err(e);
        }
        Ok(self.state.lock().live.values().map(|l| l.range.clone()).collect())
    }
}
