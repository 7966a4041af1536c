//! Lease records: the durable ownership and progress state of each partition.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        LeaseManager                          │
//! │  acquire / renew / release / checkpoint / update_properties  │
//! │                             │                                │
//! │                             ▼                                │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                    LeaseUpdater                        │  │
//! │  │  apply fn → replace(if_match = etag)                   │  │
//! │  │  412 → re-read server copy, retry (max 5)              │  │
//! │  │  409 / 404 → LeaseLost                                 │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ItemStore (lease container)                                 │
//! │   <prefix>..<partition>   one lease per partition            │
//! │   <prefix>.info           initialized marker   (LeaseStore)  │
//! │   <prefix>.lock           bootstrap lock, TTL  (LeaseStore)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! No host-side lock guards lease mutation. Mutual exclusion between hosts
//! comes entirely from the concurrency token presented on every write.

mod manager;
mod model;
mod store;
mod updater;

pub use manager::LeaseManager;
pub use model::Lease;
pub use store::LeaseStore;
pub use updater::{LeaseUpdater, RETRY_COUNT_ON_CONFLICT};
