//! Durable vote queue seam
//!
//! The queue service is an external collaborator. This module defines the
//! capability the pipeline needs from it ([`VoteQueue`]), an in-memory
//! implementation used by tests and single-process deployments, and the
//! retrying [`QueueConsumer`] wrapper the workers drive.

pub mod consumer;
pub mod memory;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use consumer::QueueConsumer;
pub use memory::InMemoryQueue;

/// One delivery of a queued message
///
/// `message_id` is the envelope id assigned at submission and is stable
/// across redeliveries. `receipt` identifies this particular delivery and is
/// what acknowledgement, requeue and dead-lettering refer to: two deliveries
/// of the same envelope can be in flight at the same time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub receipt: String,
    pub message_id: String,
    pub body: Vec<u8>,

    /// 1 on first delivery, incremented on every redelivery
    pub delivery_count: u32,

    pub enqueued_at: DateTime<Utc>,
}

/// Why an envelope was moved to the dead-letter path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeadLetterReason {
    /// Missing or malformed fields
    InvalidEnvelope(String),

    /// Option not in the candidate set
    InvalidOption(String),

    /// The storage layer refused the write
    ConstraintViolation(String),

    /// Transient failures persisted across every allowed delivery
    RetriesExhausted { attempts: u32, last_error: String },
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEnvelope(reason) => write!(f, "invalid_envelope: {reason}"),
            Self::InvalidOption(option) => write!(f, "invalid_option: {option}"),
            Self::ConstraintViolation(message) => write!(f, "constraint_violation: {message}"),
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "retries_exhausted after {attempts} attempts: {last_error}"),
        }
    }
}

/// A message parked on the dead-letter path, with its full body for redrive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: QueuedMessage,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Capabilities required from the durable queue service
///
/// Implementations deliver at least once: a delivery that is neither
/// acknowledged nor requeued is eventually delivered again.
#[async_trait]
pub trait VoteQueue: Send + Sync {
    /// Wait up to `timeout` for the next message; `Ok(None)` on timeout
    async fn dequeue(&self, timeout: Duration) -> Result<Option<QueuedMessage>>;

    /// Remove a delivered message for good
    async fn ack(&self, receipt: &str) -> Result<()>;

    /// Return a delivered message to the queue, visible again after `delay`
    async fn requeue(&self, receipt: &str, delay: Duration) -> Result<()>;

    /// Park a delivered message on the dead-letter path.
    /// The delivery itself must still be acknowledged afterwards.
    async fn dead_letter(&self, message: &QueuedMessage, reason: &DeadLetterReason) -> Result<()>;
}
