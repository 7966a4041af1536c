//! Per-partition processing: feed polling, lease renewal and their lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      PartitionController                        │
//! │  running: DashMap<lease token, RunningPartition>                │
//! │  acquire lease → spawn supervisor on the injected runtime       │
//! │  outcome: split → fan out │ gone → delete │ other → release     │
//! └─────────────────────────────────────────────────────────────────┘
//!            │ one task per owned lease
//!            ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      PartitionSupervisor                        │
//! │  open observer                                                  │
//! │  ┌───────────────────────┐     ┌─────────────────────────────┐  │
//! │  │  PartitionProcessor   │     │  LeaseRenewer               │  │
//! │  │  read page → observer │     │  renew every interval       │  │
//! │  │  sleep poll delay     │     │  LeaseLost → stop           │  │
//! │  └───────────────────────┘     └─────────────────────────────┘  │
//! │        first to finish cancels the other (child token)          │
//! │  close observer with the mapped CloseReason                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All waits race a [`CancellationToken`], so shutdown never waits for a
//! full poll delay or renew interval.

mod controller;
mod processor;
mod renewer;
mod supervisor;
mod synchronizer;

pub use controller::{ClosedPartition, PartitionController, CLOSED_PARTITIONS_RETAINED};
pub use processor::{PartitionProcessor, PartitionProcessorSettings};
pub use renewer::LeaseRenewer;
pub use supervisor::PartitionSupervisor;
pub use synchronizer::PartitionSynchronizer;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless `token` fires first.
///
/// Returns `false` when cancelled.
pub(crate) async fn sleep_or_cancelled(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
