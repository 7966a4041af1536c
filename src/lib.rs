//! Lease-based change feed processing across a fleet of hosts.
//!
//! A change feed is split into partitions. Every partition has a lease record
//! in a shared lease container; hosts compete for leases, process the
//! partitions they own and checkpoint their progress into the lease so that
//! another host can resume where they stopped.
//!
//! # Features
//!
//! - One-time bootstrap of the lease container, safe with concurrent hosts
//! - Equal distribution of partitions across hosts, with lease stealing
//! - Lease renewal, expiry and takeover of partitions of dead hosts
//! - Automatic or observer-driven checkpointing
//! - Transparent handling of partition splits
//! - Backlog estimation from checkpoints
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use changefeed_processor::{
//!     ChangeFeedObserver, ChangeFeedProcessor, ChangeRecord, ObserverContext, ObserverResult,
//!     ProcessorOptions,
//! };
//! use changefeed_processor::testing::{InMemoryChangeFeed, InMemoryItemStore};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl ChangeFeedObserver for Printer {
//!     async fn process_changes(&self, ctx: &ObserverContext, changes: &[ChangeRecord]) -> ObserverResult {
//!         for change in changes {
//!             println!("{}: {}", ctx.partition_id(), change.id);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let feed = Arc::new(InMemoryChangeFeed::with_partitions(4));
//!     let leases = Arc::new(InMemoryItemStore::new());
//!
//!     let processor = ChangeFeedProcessor::builder()
//!         .with_host_name("host-1")
//!         .with_feed_source(feed.clone())
//!         .with_topology(feed.clone())
//!         .with_lease_container(leases)
//!         .with_observer_factory(|| Box::new(Printer) as Box<dyn ChangeFeedObserver>)
//!         .with_options(ProcessorOptions::default().with_lease_prefix("orders"))
//!         .build()?;
//!
//!     processor.start().await?;
//!     feed.append("0", "order-1", "{}")?;
//!     // ...
//!     processor.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            ChangeFeedProcessor              │
//! │  start() → Bootstrapper → LoadBalancer      │
//! │  stop()  → release every owned lease        │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │          PartitionLoadBalancer              │
//! │  EqualPartitionsBalancingStrategy           │
//! └─────────────────────────────────────────────┘
//!                     │ leases to take
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │          PartitionController                │
//! │  one PartitionSupervisor per owned lease    │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌──────────────┐
//! │Processor│   │ Renewer  │   │  Observer    │
//! │read feed│   │keep lease│   │ + checkpoint │
//! └─────────┘   └──────────┘   └──────────────┘
//!     │               │               │
//!     ▼               └───────┬───────┘
//! ChangeFeedSource        LeaseManager → ItemStore
//! ```
//!
//! # Delivery guarantees
//!
//! - **At least once**: changes after the last checkpoint are redelivered
//!   when a partition moves to another host or its observer fails.
//! - **In order per partition**: a partition is processed by at most one
//!   host at a time, page by page.

pub mod balancing;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod estimator;
pub mod host;
pub mod lease;
pub mod observer;
pub mod processing;
pub mod store;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{CheckpointFrequency, ProcessorOptions, StartFrom};
pub use error::{Error, LeaseLostReason, ObserverError, Result, StoreError};
pub use host::{ChangeFeedProcessor, ChangeFeedProcessorBuilder};
pub use types::{ChangeRecord, FeedRange, PartitionId, PartitionKeyRange};

// Re-export observer types
pub use observer::{
    BoxError, ChangeFeedObserver, CloseReason, ObserverContext, ObserverFactory, ObserverResult,
};

// Re-export collaborator traits
pub use store::{ChangeFeedSource, FeedPage, FeedRequest, ItemStore, PartitionTopology, StoredItem};

// Re-export lease and estimation types
pub use estimator::{RemainingWork, RemainingWorkEstimator};
pub use lease::{Lease, LeaseManager, LeaseStore};
