//! Lease distribution across hosts.
//!
//! ```text
//! every acquire interval:
//!
//!   list_all_leases ──▶ EqualPartitionsBalancingStrategy ──▶ leases to take
//!                                                               │
//!                        PartitionController::add_or_update_lease ◀┘
//! ```
//!
//! The strategy is a pure function over the lease set; all I/O happens in
//! [`PartitionLoadBalancer`].

mod balancer;
mod strategy;

pub use balancer::PartitionLoadBalancer;
pub use strategy::EqualPartitionsBalancingStrategy;
