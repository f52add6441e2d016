//! # Core Types for the Vote Tallying Pipeline
//!
//! This module defines the data that flows between the queue, the aggregation
//! engine, the persistence layer and live subscribers.
//!
//! ## Type Categories
//!
//! ### Inputs
//! - [`VoteEnvelope`]: a single cast vote with a submission-time identity
//! - [`CandidateSet`]: the fixed set of options loaded at startup
//!
//! ### Aggregate state
//! - [`TallySnapshot`]: per-option counts plus a monotonically increasing version
//! - [`CommitResult`]: outcome of a transactional commit
//! - [`ProcessedMarker`]: per-consumer durable progress record
//!
//! ### Transport
//! - [`UpdateMessage`]: serialized snapshot pushed to subscribers
//!
//! ## Usage Examples
//!
//! ```rust
//! use tally::types::{CandidateSet, TallySnapshot};
//!
//! let candidates = CandidateSet::new(["A", "B"]).unwrap();
//! let empty = TallySnapshot::empty(&candidates);
//!
//! let next = empty.with_vote("A").unwrap();
//! assert_eq!(next.count("A"), 1);
//! assert_eq!(next.version, 1);
//!
//! // Unknown options are not part of the tally
//! assert!(empty.with_vote("Z").is_none());
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// A BLAKE3 digest (32 bytes)
pub type Hash = [u8; 32];

/// Upper bound on the length of any identifier field in an envelope
pub const MAX_FIELD_LEN: usize = 256;

/// A single cast vote as it travels through the queue
///
/// The `envelope_id` is assigned once, at submission time, and is carried
/// unchanged through every redelivery. It is the key the persistence layer
/// uses to detect that an envelope has already been counted.
///
/// # Examples
///
/// ```rust
/// use tally::types::VoteEnvelope;
///
/// let envelope = VoteEnvelope::new("voter-42", "A");
/// let body = envelope.encode().unwrap();
///
/// let decoded = VoteEnvelope::decode(&body).unwrap();
/// assert_eq!(decoded.envelope_id, envelope.envelope_id);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoteEnvelope {
    /// Unique per submission attempt
    pub envelope_id: String,

    /// Opaque voter identifier; never interpreted by the pipeline
    pub voter_id: String,

    /// Selected option, expected to be a member of the [`CandidateSet`]
    pub option: String,

    /// When the vote was submitted
    pub submitted_at: DateTime<Utc>,
}

/// Wire shape used while decoding, so that missing fields can be reported
/// precisely instead of as a generic parse failure.
#[derive(Deserialize)]
struct RawEnvelope {
    envelope_id: Option<String>,
    voter_id: Option<String>,
    option: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
}

impl VoteEnvelope {
    /// Create an envelope as the submission endpoint would, with a fresh id
    pub fn new(voter_id: impl Into<String>, option: impl Into<String>) -> Self {
        Self {
            envelope_id: Uuid::new_v4().to_string(),
            voter_id: voter_id.into(),
            option: option.into(),
            submitted_at: Utc::now(),
        }
    }

    /// Create an envelope with an explicit id (redelivery, replay, tests)
    pub fn with_id(
        envelope_id: impl Into<String>,
        voter_id: impl Into<String>,
        option: impl Into<String>,
    ) -> Self {
        Self {
            envelope_id: envelope_id.into(),
            voter_id: voter_id.into(),
            option: option.into(),
            submitted_at: Utc::now(),
        }
    }

    /// Serialize for enqueueing
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and structurally validate a queue payload
    ///
    /// Fails with [`Error::InvalidEnvelope`] when the payload is not JSON,
    /// when a field is missing, or when an identifier is blank or oversized.
    /// Option membership is checked later, against the [`CandidateSet`].
    pub fn decode(body: &[u8]) -> Result<Self> {
        let raw: RawEnvelope = serde_json::from_slice(body)
            .map_err(|e| Error::invalid_envelope(format!("malformed payload: {e}")))?;

        let envelope_id = required_field(raw.envelope_id, "envelope_id")?;
        let voter_id = required_field(raw.voter_id, "voter_id")?;
        let option = required_field(raw.option, "option")?;
        let submitted_at = raw
            .submitted_at
            .ok_or_else(|| Error::invalid_envelope("missing field submitted_at"))?;

        Ok(Self {
            envelope_id,
            voter_id,
            option,
            submitted_at,
        })
    }
}

/// Identifiers are kept byte for byte: `"1"` and `"1 "` are distinct
/// envelopes, and `" A"` is not the candidate `"A"`.
fn required_field(value: Option<String>, name: &str) -> Result<String> {
    let value = value.ok_or_else(|| Error::invalid_envelope(format!("missing field {name}")))?;

    if value.trim().is_empty() {
        return Err(Error::invalid_envelope(format!("empty field {name}")));
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(Error::invalid_envelope(format!(
            "field {name} exceeds {MAX_FIELD_LEN} bytes"
        )));
    }

    Ok(value)
}

/// The fixed set of options a vote may select
///
/// Loaded once at startup. Options are kept sorted so that snapshots and
/// digests are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSet {
    options: BTreeSet<String>,
}

impl CandidateSet {
    /// Build a candidate set, rejecting empty sets and blank names
    pub fn new<I, S>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for option in options {
            let option: String = option.into();
            let trimmed = option.trim();
            if trimmed.is_empty() {
                return Err(Error::config("candidate names must not be blank"));
            }
            if trimmed.len() > MAX_FIELD_LEN {
                return Err(Error::config(format!(
                    "candidate name exceeds {MAX_FIELD_LEN} bytes"
                )));
            }
            if !set.insert(trimmed.to_string()) {
                return Err(Error::config(format!("duplicate candidate: {trimmed}")));
            }
        }

        if set.is_empty() {
            return Err(Error::config("candidate set must not be empty"));
        }

        Ok(Self { options: set })
    }

    /// Parse a comma separated list, e.g. `"A,B,C"`
    pub fn parse(list: &str) -> Result<Self> {
        Self::new(list.split(',').map(str::trim).filter(|s| !s.is_empty()))
    }

    pub fn contains(&self, option: &str) -> bool {
        self.options.contains(option)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

/// Aggregate tally state at a specific version
///
/// Every option in the candidate set has an entry, starting at zero.
/// `version` increases by exactly one per committed envelope, so the sum of
/// all counts always equals `version` for a store that started empty.
/// Subscribers use it to detect staleness and missed updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TallySnapshot {
    /// Option name to accepted vote count
    pub counts: BTreeMap<String, u64>,

    /// Number of commits reflected in this snapshot
    pub version: u64,

    /// When this snapshot was produced
    pub taken_at: DateTime<Utc>,
}

impl TallySnapshot {
    /// A zeroed tally for every candidate
    pub fn empty(candidates: &CandidateSet) -> Self {
        Self {
            counts: candidates.iter().map(|o| (o.to_string(), 0)).collect(),
            version: 0,
            taken_at: Utc::now(),
        }
    }

    /// The tally after one more distinct vote for `option`
    ///
    /// Pure: `self` is left untouched. Returns `None` for an option that has
    /// no row in the tally. Callers are responsible for the de-duplication
    /// check; this function only describes what one new vote does.
    pub fn with_vote(&self, option: &str) -> Option<Self> {
        let current = *self.counts.get(option)?;
        let mut counts = self.counts.clone();
        counts.insert(option.to_string(), current + 1);

        Some(Self {
            counts,
            version: self.version + 1,
            taken_at: Utc::now(),
        })
    }

    pub fn count(&self, option: &str) -> u64 {
        self.counts.get(option).copied().unwrap_or(0)
    }

    /// Sum of all counts
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn is_newer_than(&self, other: &TallySnapshot) -> bool {
        self.version > other.version
    }

    /// BLAKE3 digest over the version and the sorted counts
    ///
    /// `taken_at` is excluded: two snapshots of the same committed state
    /// produce the same digest.
    pub fn digest(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.version.to_le_bytes());
        for (option, count) in &self.counts {
            hasher.update(option.as_bytes());
            hasher.update(&[0u8]);
            hasher.update(&count.to_le_bytes());
        }
        hasher.finalize().into()
    }
}

/// Outcome of [`crate::store::TallyStore::commit`]
#[derive(Debug, Clone, PartialEq)]
pub enum CommitResult {
    /// The envelope was counted; `snapshot` is the state inside the same transaction
    Committed {
        new_total: u64,
        snapshot: TallySnapshot,
    },

    /// The envelope id was already in the processed set; nothing changed
    AlreadyProcessed,
}

impl CommitResult {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Durable per-consumer progress record
///
/// Created on the first successful commit of a consumer and advanced by every
/// later one. `last_version` never decreases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedMarker {
    pub consumer_id: String,
    pub last_envelope_id: String,
    pub last_version: u64,
    pub commits: u64,
    pub updated_at: DateTime<Utc>,
}

impl ProcessedMarker {
    /// First marker for a consumer
    pub fn first(consumer_id: &str, envelope_id: &str, version: u64) -> Self {
        Self {
            consumer_id: consumer_id.to_string(),
            last_envelope_id: envelope_id.to_string(),
            last_version: version,
            commits: 1,
            updated_at: Utc::now(),
        }
    }

    /// Marker after another commit; keeps the higher version
    pub fn advanced(&self, envelope_id: &str, version: u64) -> Self {
        if version <= self.last_version {
            return self.clone();
        }

        Self {
            consumer_id: self.consumer_id.clone(),
            last_envelope_id: envelope_id.to_string(),
            last_version: version,
            commits: self.commits + 1,
            updated_at: Utc::now(),
        }
    }
}

/// Serialized snapshot pushed to subscribers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateMessage {
    pub snapshot: TallySnapshot,

    /// Hex BLAKE3 digest of the snapshot's counts and version
    pub digest: String,
}

impl UpdateMessage {
    pub fn from_snapshot(snapshot: &TallySnapshot) -> Self {
        Self {
            digest: hex::encode(snapshot.digest()),
            snapshot: snapshot.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Whether the digest matches the carried snapshot
    pub fn verify(&self) -> bool {
        hex::encode(self.snapshot.digest()) == self.digest
    }
}
