//! Aggregation engine
//!
//! Per envelope state machine:
//!
//! ```text
//! Received ──► Validated ──► Applied
//!     │            │
//!     └────────────┴──► Rejected(duplicate | invalid_option | invalid_envelope)
//! ```
//!
//! The engine holds only a working copy of the tally. The committed state is
//! owned by the [`TallyStore`]; the working copy is initialised from it on
//! recovery and replaced by the snapshot each successful commit returns, so
//! it never counts anything the store has not counted.

use crate::queue::DeadLetterReason;
use crate::store::TallyStore;
use crate::types::{CandidateSet, CommitResult, TallySnapshot, VoteEnvelope};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Why an envelope was not applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Rejection {
    /// Already counted; expected under at-least-once delivery
    Duplicate,
    /// Option outside the candidate set
    InvalidOption(String),
    /// Missing or malformed fields
    InvalidEnvelope(String),
}

impl Rejection {
    /// Dead-letter reason for rejections that must be parked; `None` for duplicates
    pub fn dead_letter_reason(&self) -> Option<DeadLetterReason> {
        match self {
            Self::Duplicate => None,
            Self::InvalidOption(option) => Some(DeadLetterReason::InvalidOption(option.clone())),
            Self::InvalidEnvelope(reason) => Some(DeadLetterReason::InvalidEnvelope(reason.clone())),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplicate => write!(f, "duplicate"),
            Self::InvalidOption(option) => write!(f, "invalid_option: {option}"),
            Self::InvalidEnvelope(reason) => write!(f, "invalid_envelope: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeState {
    Received,
    Validated,
    Applied,
    Rejected(Rejection),
}

/// A validated envelope waiting for its transactional commit
#[derive(Debug, Clone, PartialEq)]
pub struct StagedWrite {
    pub envelope: VoteEnvelope,
}

impl StagedWrite {
    pub fn envelope_id(&self) -> &str {
        &self.envelope.envelope_id
    }

    pub fn option(&self) -> &str {
        &self.envelope.option
    }
}

/// Result of admitting a raw queue payload
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Staged(StagedWrite),
    Rejected(Rejection),
}

/// Bounded set of recently committed envelope ids
///
/// A local fast path only: a miss here says nothing, a hit means this engine
/// already saw the id committed. The store's processed set stays authoritative.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            ids: HashSet::new(),
        }
    }

    pub fn contains(&self, envelope_id: &str) -> bool {
        self.ids.contains(envelope_id)
    }

    /// Remember an id, evicting the oldest when full
    pub fn insert(&mut self, envelope_id: &str) {
        if self.capacity == 0 || self.ids.contains(envelope_id) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(envelope_id.to_string());
        self.ids.insert(envelope_id.to_string());
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub received: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub invalid: u64,
}

pub struct AggregationEngine {
    candidates: CandidateSet,
    working: TallySnapshot,
    window: DedupWindow,
    stats: EngineStats,
}

impl AggregationEngine {
    pub fn new(candidates: CandidateSet, snapshot: TallySnapshot, window_capacity: usize) -> Self {
        Self {
            candidates,
            working: snapshot,
            window: DedupWindow::new(window_capacity),
            stats: EngineStats::default(),
        }
    }

    /// Initialise the working copy from the last committed tally
    ///
    /// Reads one snapshot; the cost does not depend on queue depth.
    pub async fn recover(
        candidates: CandidateSet,
        store: &dyn TallyStore,
        window_capacity: usize,
    ) -> Result<Self> {
        let snapshot = store.load_snapshot().await?;

        let missing: Vec<&str> = candidates
            .iter()
            .filter(|option| !snapshot.counts.contains_key(*option))
            .collect();
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "tally store has no row for candidates: {}",
                missing.join(", ")
            )));
        }
        for option in snapshot.counts.keys() {
            if !candidates.contains(option) {
                tracing::warn!(option = %option, "Persisted option is not a current candidate");
            }
        }

        tracing::info!(
            version = snapshot.version,
            total = snapshot.total(),
            "🗳️  Recovered tally from store"
        );

        Ok(Self::new(candidates, snapshot, window_capacity))
    }

    /// Received → Validated, or Received → Rejected
    pub fn admit(&mut self, body: &[u8]) -> Admission {
        self.stats.received += 1;

        let envelope = match VoteEnvelope::decode(body) {
            Ok(envelope) => envelope,
            Err(Error::InvalidEnvelope { reason }) => {
                self.stats.invalid += 1;
                return Admission::Rejected(Rejection::InvalidEnvelope(reason));
            }
            Err(other) => {
                self.stats.invalid += 1;
                return Admission::Rejected(Rejection::InvalidEnvelope(other.to_string()));
            }
        };

        if !self.candidates.contains(&envelope.option) {
            self.stats.invalid += 1;
            return Admission::Rejected(Rejection::InvalidOption(envelope.option));
        }

        if self.window.contains(&envelope.envelope_id) {
            self.stats.duplicates += 1;
            return Admission::Rejected(Rejection::Duplicate);
        }

        Admission::Staged(StagedWrite { envelope })
    }

    /// Validated → Applied (or Rejected(Duplicate) when the store had it already)
    pub fn apply(&mut self, staged: &StagedWrite, result: &CommitResult) -> EnvelopeState {
        self.window.insert(staged.envelope_id());

        match result {
            CommitResult::Committed { snapshot, .. } => {
                if snapshot.is_newer_than(&self.working) {
                    self.working = snapshot.clone();
                }
                self.stats.applied += 1;
                EnvelopeState::Applied
            }
            CommitResult::AlreadyProcessed => {
                self.stats.duplicates += 1;
                EnvelopeState::Rejected(Rejection::Duplicate)
            }
        }
    }

    /// Fold a snapshot committed elsewhere into the working copy
    pub fn reconcile(&mut self, snapshot: &TallySnapshot) {
        if snapshot.is_newer_than(&self.working) {
            self.working = snapshot.clone();
        }
    }

    pub fn snapshot(&self) -> &TallySnapshot {
        &self.working
    }

    pub fn candidates(&self) -> &CandidateSet {
        &self.candidates
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }
}
