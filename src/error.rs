//! Error types for the change feed processor.

use crate::lease::Lease;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for change feed processor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the change feed processor.
#[derive(Error, Debug)]
pub enum Error {
    /// Error surfaced by the lease container or the feed source.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The lease is no longer owned by this host (or no longer exists).
    #[error("lease lost: {lease_token} ({reason})")]
    LeaseLost {
        lease_token: String,
        reason: LeaseLostReason,
        /// Last copy of the lease read from the store, if any.
        server_lease: Option<Box<Lease>>,
    },

    /// The partition no longer exists in the source.
    #[error("partition not found: {partition_id}")]
    PartitionNotFound {
        partition_id: String,
        last_continuation: Option<String>,
    },

    /// The partition has been split into child partitions.
    #[error("partition split: {partition_id}")]
    PartitionSplit {
        partition_id: String,
        last_continuation: Option<String>,
    },

    /// The user observer failed.
    #[error("observer error: {0}")]
    Observer(#[from] ObserverError),

    /// The partition topology reported by the source is not usable.
    #[error("topology error: {0}")]
    Topology(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The component was already started.
    #[error("already started")]
    AlreadyStarted,

    /// The component has not been started.
    #[error("not started")]
    NotStarted,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a lease-lost error for the given lease.
    pub fn lease_lost(lease: &Lease, reason: LeaseLostReason) -> Self {
        Error::LeaseLost {
            lease_token: lease.lease_token.clone(),
            reason,
            server_lease: None,
        }
    }

    /// Check whether this is a lease-lost error.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Error::LeaseLost { .. })
    }

    /// Check whether this is the cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Why a lease was considered lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseLostReason {
    /// Another host owns the lease now.
    OwnerChanged,
    /// The lease record was deleted.
    Deleted,
    /// The store reported a hard conflict on replace.
    Conflict,
    /// Optimistic concurrency retries ran out.
    RetriesExhausted,
}

impl fmt::Display for LeaseLostReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeaseLostReason::OwnerChanged => "owner changed",
            LeaseLostReason::Deleted => "deleted",
            LeaseLostReason::Conflict => "conflict",
            LeaseLostReason::RetriesExhausted => "retries exhausted",
        };
        f.write_str(s)
    }
}

/// Outcomes reported by the external store and feed collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Record (or partition) not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Conditional write presented a stale concurrency token.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Record already exists or was committed concurrently.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The feed partition is gone.
    #[error("partition gone: {0}")]
    PartitionGone(String),

    /// The feed partition was split.
    #[error("partition split: {0}")]
    PartitionSplit(String),

    /// The requested page size is too large for the store.
    #[error("page too large: requested {requested} items")]
    PageTooLarge { requested: usize },

    /// Request rate too large.
    #[error("throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    /// Service unavailable or other transient transport failure.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Record body could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A failure raised by user observer code.
#[derive(Debug)]
pub struct ObserverError {
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl ObserverError {
    /// Wrap an arbitrary user error.
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// The original user error.
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }
}

impl fmt::Display for ObserverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for ObserverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Store(StoreError::from(e))
    }
}
