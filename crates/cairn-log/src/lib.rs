//! Transparency log engine: deduplication, sequencing, root signing and
//! the query surface.
//!
//! - [`Deduplicator`]: builds leaves from submissions and maps each
//!   identity to its canonical leaf.
//! - [`Sequencer`]: integrates queued leaves into the tree in batches,
//!   one atomic store write per batch.
//! - [`RootSigner`]: signed, timestamped commitments to tree heads.
//! - [`LogService`]: the external operations, scoped by [`LogId`].
//!
//! [`LogId`]: cairn_types::LogId

mod dedup;
mod error;
mod sequencer;
mod service;
mod signer;

#[cfg(test)]
mod tests;

pub use dedup::Deduplicator;
pub use error::{ErrorKind, LogError};
pub use sequencer::{IntegrationReport, Sequencer, SequencerConfig, SequencerStats};
pub use service::{EntryAndProof, LatestRoot, LogService, LogServiceConfig};
pub use signer::{Ed25519Signer, Ed25519Verifier, LogSigner, LogVerifier, RootSigner};
