//! Leaf storage trait and backend implementations.
//!
//! This crate defines the [`LeafStore`] trait for persisting a log's queued
//! and sequenced leaves, Merkle nodes, tree heads, signed roots and
//! sequencing leases, along with its backends:
//!
//! - [`MemoryLeafStore`]: in-memory storage, one `RwLock` per log.
//! - [`FjallLeafStore`]: persistent storage over Fjall keyspaces with
//!   atomic write batches.
//! - [`FaultyStore`]: a wrapper that injects commit failures for tests.

mod error;
mod faulty_store;
mod fjall_store;
mod memory_store;
mod traits;

#[cfg(test)]
mod tests;

pub use error::StoreError;
pub use faulty_store::FaultyStore;
pub use fjall_store::FjallLeafStore;
pub use memory_store::MemoryLeafStore;
pub use traits::{IntegrationBatch, LeafStore, Lease, LogNodes, QueuedEntry};
