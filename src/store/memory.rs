//! In-memory transactional tally store
//!
//! A commit stages the complete post-commit state first and publishes it
//! with a single swap under the store lock, so an abort at any step leaves
//! the previously committed state untouched.

use super::TallyStore;
use crate::types::{CandidateSet, CommitResult, ProcessedMarker, TallySnapshot};
use crate::{Error, Result, storage_error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Fault injection switches for outage and crash testing
#[derive(Debug, Default)]
pub struct StoreFaults {
    unavailable: AtomicBool,
    crash_after_increment: AtomicU32,
    commit_latency_ms: AtomicU64,
    response_latency_ms: AtomicU64,
}

impl StoreFaults {
    /// Fail every operation with `StorageUnavailable` until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Abort the next `count` commits after the increment step, before the
    /// processed id is recorded
    pub fn crash_next_commits(&self, count: u32) {
        self.crash_after_increment.store(count, Ordering::SeqCst);
    }

    /// Add latency to every commit, before the transaction starts
    pub fn set_commit_latency(&self, latency: Duration) {
        self.commit_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay the reply of every commit after it has been applied, as a
    /// slow network would
    pub fn set_response_latency(&self, latency: Duration) {
        self.response_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    fn take_crash(&self) -> bool {
        self.crash_after_increment
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn commit_latency(&self) -> Duration {
        Duration::from_millis(self.commit_latency_ms.load(Ordering::SeqCst))
    }

    fn response_latency(&self) -> Duration {
        Duration::from_millis(self.response_latency_ms.load(Ordering::SeqCst))
    }
}

struct StoreState {
    snapshot: TallySnapshot,
    processed: HashMap<String, DateTime<Utc>>,
    markers: HashMap<String, ProcessedMarker>,
}

pub struct InMemoryTallyStore {
    state: Mutex<StoreState>,
    faults: StoreFaults,
}

impl InMemoryTallyStore {
    /// A store with a zeroed tally row for every candidate
    pub fn new(candidates: &CandidateSet) -> Self {
        Self {
            state: Mutex::new(StoreState {
                snapshot: TallySnapshot::empty(candidates),
                processed: HashMap::new(),
                markers: HashMap::new(),
            }),
            faults: StoreFaults::default(),
        }
    }

    pub fn faults(&self) -> &StoreFaults {
        &self.faults
    }

    /// Size of the processed-id set
    pub fn processed_len(&self) -> Result<usize> {
        Ok(self.lock()?.processed.len())
    }

    /// The transaction itself; runs entirely under the store lock
    fn apply_commit(&self, consumer_id: &str, envelope_id: &str, option: &str) -> Result<CommitResult> {
        let mut state = self.lock()?;

        // (a) membership check under the same lock as the write
        if state.processed.contains_key(envelope_id) {
            return Ok(CommitResult::AlreadyProcessed);
        }

        // (b) staged increment
        let next = state.snapshot.with_vote(option).ok_or_else(|| {
            Error::constraint_violation(format!("no tally row for option {option}"))
        })?;

        if self.faults.take_crash() {
            tracing::warn!(envelope_id, "💥 Injected crash after increment, rolling back");
            return Err(storage_error!("transaction aborted after increment of {}", option));
        }

        // (c) processed id and marker, then publish the staged state
        let marker = match state.markers.get(consumer_id) {
            Some(marker) => marker.advanced(envelope_id, next.version),
            None => ProcessedMarker::first(consumer_id, envelope_id, next.version),
        };
        let new_total = next.count(option);

        state.processed.insert(envelope_id.to_string(), Utc::now());
        state.markers.insert(consumer_id.to_string(), marker);
        state.snapshot = next.clone();

        Ok(CommitResult::Committed {
            new_total,
            snapshot: next,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| Error::internal("Tally store lock poisoned"))
    }

    fn ensure_available(&self) -> Result<()> {
        if self.faults.is_unavailable() {
            Err(storage_error!("in-memory store marked unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TallyStore for InMemoryTallyStore {
    async fn commit(&self, consumer_id: &str, envelope_id: &str, option: &str) -> Result<CommitResult> {
        let latency = self.faults.commit_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.ensure_available()?;

        let result = self.apply_commit(consumer_id, envelope_id, option)?;

        let latency = self.faults.response_latency();
        if result.is_committed() && !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(result)
    }

    async fn load_snapshot(&self) -> Result<TallySnapshot> {
        self.ensure_available()?;
        let mut snapshot = self.lock()?.snapshot.clone();
        snapshot.taken_at = Utc::now();
        Ok(snapshot)
    }

    async fn processed_marker(&self, consumer_id: &str) -> Result<Option<ProcessedMarker>> {
        self.ensure_available()?;
        Ok(self.lock()?.markers.get(consumer_id).cloned())
    }

    async fn is_processed(&self, envelope_id: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.lock()?.processed.contains_key(envelope_id))
    }

    async fn prune_processed(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.ensure_available()?;
        let mut state = self.lock()?;
        let before = state.processed.len();
        state.processed.retain(|_, committed_at| *committed_at >= cutoff);
        Ok(before - state.processed.len())
    }
}
