//! Transactional tally persistence
//!
//! The storage engine is an external collaborator. [`TallyStore`] is the
//! capability the pipeline needs from it: one atomic check-and-increment per
//! envelope, a consistent snapshot read for recovery, and retention pruning
//! of the processed-id set.
//!
//! The processed-set membership check inside `commit` is the only mechanism
//! that prevents double counting across concurrently running consumers, so
//! every implementation must perform it in the same transaction as the
//! increment.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::Result;
use crate::types::{CommitResult, ProcessedMarker, TallySnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::{InMemoryTallyStore, StoreFaults};
#[cfg(feature = "postgres")]
pub use postgres::PostgresTallyStore;

#[async_trait]
pub trait TallyStore: Send + Sync {
    /// Count one envelope, atomically:
    /// (a) if `envelope_id` is already processed return
    ///     [`CommitResult::AlreadyProcessed`] without touching counts,
    /// (b) increment the count for `option`,
    /// (c) record `envelope_id` as processed and advance the consumer's marker.
    ///
    /// Fails with `StorageUnavailable` (retryable) or `ConstraintViolation`
    /// (fatal for this envelope). On failure nothing is applied.
    async fn commit(&self, consumer_id: &str, envelope_id: &str, option: &str) -> Result<CommitResult>;

    /// Last fully committed tally
    async fn load_snapshot(&self) -> Result<TallySnapshot>;

    async fn processed_marker(&self, consumer_id: &str) -> Result<Option<ProcessedMarker>>;

    async fn is_processed(&self, envelope_id: &str) -> Result<bool>;

    /// Forget processed ids committed before `cutoff`; returns how many were removed
    async fn prune_processed(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
