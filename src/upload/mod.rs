//! Resumable Chunked Upload Module
//!
//! Implements the upload pipeline behind `/fichiers`:
//! - Chunk persistence with resume support, keyed by byte offset
//! - Optional per-chunk digest checks, failing fast
//! - Whole-file verification on a bounded worker queue
//! - Finalize with a bounded wait and hand-off to the intake
//!
//! Protocol Flow:
//! 1. Client asks where to resume (`GET /fichiers/job/{id}`)
//! 2. Client PUTs chunks at their byte offsets, in any order
//! 3. Client POSTs finalize with the expected digest
//! 4. A worker re-hashes the assembled chunks and hands them off, or purges them

pub mod chunk_store;
pub mod finalize;
pub mod hash;
pub mod queue;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use chunk_store::ChunkStore;
pub use finalize::FinalizeCoordinator;
pub use hash::{compute_hash, HashVerifier, IntegrityError};
pub use queue::{VerificationQueue, WorkerConfig, WorkerPool};
pub use types::*;
