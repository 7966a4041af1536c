//! Change feed observers and the decorators the engine puts around them.
//!
//! User code implements [`ChangeFeedObserver`] and hands the processor an
//! [`ObserverFactory`]. For every partition it starts, the engine builds the
//! chain
//!
//! ```text
//! AutoCheckpointer ──▶ ObserverExceptionWrapper ──▶ user observer
//! ```
//!
//! The wrapper turns user failures (errors and panics) into
//! [`Error::Observer`](crate::Error::Observer); the auto-checkpointer persists
//! progress according to the configured
//! [`CheckpointFrequency`](crate::config::CheckpointFrequency).

mod auto_checkpoint;
mod checkpointer;
mod wrapper;

pub use auto_checkpoint::AutoCheckpointer;
pub use checkpointer::{LeaseCheckpointer, PartitionCheckpointer};
pub use wrapper::ObserverExceptionWrapper;

use crate::error::Result;
use crate::types::{ChangeRecord, PartitionId};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Error type returned by user observer code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by user observer code.
pub type ObserverResult = std::result::Result<(), BoxError>;

/// Why an observer is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Processing stopped for an unclassified reason.
    Unknown,
    /// The host is shutting down.
    Shutdown,
    /// The partition is gone (split or removed).
    ResourceGone,
    /// Another host took the lease.
    LeaseLost,
    /// The observer itself failed.
    ObserverError,
    /// The lease record was deleted.
    LeaseGone,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Unknown => "unknown",
            CloseReason::Shutdown => "shutdown",
            CloseReason::ResourceGone => "resource gone",
            CloseReason::LeaseLost => "lease lost",
            CloseReason::ObserverError => "observer error",
            CloseReason::LeaseGone => "lease gone",
        };
        f.write_str(s)
    }
}

/// What an observer sees of the partition it is processing.
#[derive(Clone)]
pub struct ObserverContext {
    partition_id: PartitionId,
    continuation: Option<String>,
    checkpointer: Arc<dyn PartitionCheckpointer>,
}

impl ObserverContext {
    /// Create a context for `partition_id`.
    pub fn new(partition_id: impl Into<PartitionId>, checkpointer: Arc<dyn PartitionCheckpointer>) -> Self {
        Self {
            partition_id: partition_id.into(),
            continuation: None,
            checkpointer,
        }
    }

    /// Context for a batch that ends at `continuation`.
    pub fn with_continuation(&self, continuation: impl Into<String>) -> Self {
        Self {
            partition_id: self.partition_id.clone(),
            continuation: Some(continuation.into()),
            checkpointer: self.checkpointer.clone(),
        }
    }

    /// The partition being processed.
    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Continuation right after the current batch.
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Persist the position right after the current batch.
    pub async fn checkpoint(&self) -> Result<()> {
        match &self.continuation {
            Some(continuation) => self.checkpointer.checkpoint_partition(continuation).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ObserverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverContext")
            .field("partition_id", &self.partition_id)
            .field("continuation", &self.continuation)
            .finish()
    }
}

/// User callback receiving the changes of one partition.
#[async_trait]
pub trait ChangeFeedObserver: Send + Sync {
    /// Called once before the first batch.
    async fn open(&self, _context: &ObserverContext) -> ObserverResult {
        Ok(())
    }

    /// Called once when processing of the partition stops.
    async fn close(&self, _context: &ObserverContext, _reason: CloseReason) -> ObserverResult {
        Ok(())
    }

    /// Called for every non-empty batch, in feed order.
    async fn process_changes(&self, context: &ObserverContext, changes: &[ChangeRecord]) -> ObserverResult;
}

/// Creates one observer per partition.
pub trait ObserverFactory: Send + Sync {
    fn create_observer(&self) -> Box<dyn ChangeFeedObserver>;
}

impl<F> ObserverFactory for F
where
    F: Fn() -> Box<dyn ChangeFeedObserver> + Send + Sync,
{
    fn create_observer(&self) -> Box<dyn ChangeFeedObserver> {
        self()
    }
}

/// Engine-side observer: the decorated chain the partition processor drives.
#[async_trait]
pub trait PartitionObserver: Send + Sync {
    async fn open(&self, context: &ObserverContext) -> Result<()>;

    async fn close(&self, context: &ObserverContext, reason: CloseReason) -> Result<()>;

    async fn process_changes(&self, context: &ObserverContext, changes: &[ChangeRecord]) -> Result<()>;
}
