//! In-memory lease container.

use crate::error::StoreError;
use crate::store::{ItemStore, StoreResult, StoredItem};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Entry {
    item: StoredItem,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// [`ItemStore`] keeping records in a map.
///
/// Behaves like a document container with optimistic concurrency:
/// - every write assigns a fresh ETag
/// - `if_match` mismatches fail with `PreconditionFailed`
/// - records with a TTL disappear once it elapses
///
/// Every call yields to the scheduler first so concurrent tasks interleave
/// at store boundaries. Failures can be queued per direction with
/// [`fail_next_write`] and [`fail_next_read`].
///
/// [`fail_next_write`]: InMemoryItemStore::fail_next_write
/// [`fail_next_read`]: InMemoryItemStore::fail_next_read
#[derive(Debug, Default)]
pub struct InMemoryItemStore {
    items: Mutex<BTreeMap<String, Entry>>,
    write_failures: Mutex<VecDeque<StoreError>>,
    read_failures: Mutex<VecDeque<StoreError>>,
    writes: AtomicU64,
}

impl InMemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next create, replace or delete with `error`.
    pub fn fail_next_write(&self, error: StoreError) {
        self.write_failures.lock().push_back(error);
    }

    /// Fail the next read or prefix read with `error`.
    pub fn fail_next_read(&self, error: StoreError) {
        self.read_failures.lock().push_back(error);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.items.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live record ids, in order.
    pub fn ids(&self) -> Vec<String> {
        let now = Instant::now();
        self.items
            .lock()
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn injected_write_failure(&self) -> StoreResult<()> {
        match self.write_failures.lock().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn injected_read_failure(&self) -> StoreResult<()> {
        match self.read_failures.lock().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stamp(mut item: StoredItem) -> Entry {
        item.etag = Some(Uuid::new_v4().to_string());
        let expires_at = item.ttl.map(|ttl| Instant::now() + ttl);
        Entry { item, expires_at }
    }

    fn live<'a>(items: &'a BTreeMap<String, Entry>, id: &str) -> Option<&'a Entry> {
        items.get(id).filter(|e| e.is_live(Instant::now()))
    }
}

#[async_trait]
impl ItemStore for InMemoryItemStore {
    async fn create_item(&self, item: StoredItem) -> StoreResult<StoredItem> {
        tokio::task::yield_now().await;
        self.injected_write_failure()?;

        let mut items = self.items.lock();
        if Self::live(&items, &item.id).is_some() {
            return Err(StoreError::Conflict(item.id));
        }
        let entry = Self::stamp(item);
        let created = entry.item.clone();
        items.insert(created.id.clone(), entry);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn read_item(&self, id: &str) -> StoreResult<StoredItem> {
        tokio::task::yield_now().await;
        self.injected_read_failure()?;

        let items = self.items.lock();
        Self::live(&items, id)
            .map(|e| e.item.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn replace_item(&self, item: StoredItem, if_match: Option<&str>) -> StoreResult<StoredItem> {
        tokio::task::yield_now().await;
        self.injected_write_failure()?;

        let mut items = self.items.lock();
        let current = Self::live(&items, &item.id).ok_or_else(|| StoreError::NotFound(item.id.clone()))?;
        if let Some(expected) = if_match {
            if current.item.etag.as_deref() != Some(expected) {
                return Err(StoreError::PreconditionFailed(item.id));
            }
        }
        let entry = Self::stamp(item);
        let replaced = entry.item.clone();
        items.insert(replaced.id.clone(), entry);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(replaced)
    }

    async fn delete_item(&self, id: &str, if_match: Option<&str>) -> StoreResult<()> {
        tokio::task::yield_now().await;
        self.injected_write_failure()?;

        let mut items = self.items.lock();
        let current = Self::live(&items, id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(expected) = if_match {
            if current.item.etag.as_deref() != Some(expected) {
                return Err(StoreError::PreconditionFailed(id.to_string()));
            }
        }
        items.remove(id);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_items_with_prefix(&self, prefix: &str) -> StoreResult<Vec<StoredItem>> {
        tokio::task::yield_now().await;
        self.injected_read_failure()?;

        let now = Instant::now();
        let items = self.items.lock();
        Ok(items
            .range(prefix.to_string()..)
            .take_while(|(id, _)| id.starts_with(prefix))
            .filter(|(_, e)| e.is_live(now))
            .map(|(_, e)| e.item.clone())
            .collect())
    }
}
