//! In-memory at-least-once queue
//!
//! Behaves like a hosted queue with visibility timeouts: a dequeued message
//! becomes invisible until it is acknowledged, requeued, or its visibility
//! timeout expires, at which point it is delivered again.

use super::{DeadLetter, DeadLetterReason, QueuedMessage, VoteQueue};
use crate::types::VoteEnvelope;
use crate::{Error, Result, queue_error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// Default visibility timeout (30 seconds)
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: Vec<u8>,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
}

impl StoredMessage {
    fn deliver(&mut self) -> QueuedMessage {
        self.delivery_count += 1;
        QueuedMessage {
            receipt: Uuid::new_v4().to_string(),
            message_id: self.message_id.clone(),
            body: self.body.clone(),
            delivery_count: self.delivery_count,
            enqueued_at: self.enqueued_at,
        }
    }
}

struct InFlight {
    stored: StoredMessage,
    invisible_until: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    delayed: Vec<(Instant, StoredMessage)>,
    in_flight: HashMap<String, InFlight>,
    dead_letters: Vec<DeadLetter>,
    acked: u64,
}

impl QueueState {
    /// Make due requeues and expired deliveries visible again
    fn promote(&mut self, now: Instant) {
        if !self.delayed.is_empty() {
            self.delayed.sort_by_key(|(visible_at, _)| *visible_at);
            let due = self.delayed.partition_point(|(visible_at, _)| *visible_at <= now);
            for (_, stored) in self.delayed.drain(..due) {
                self.ready.push_back(stored);
            }
        }

        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.invisible_until <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(flight) = self.in_flight.remove(&receipt) {
                tracing::debug!(
                    message_id = %flight.stored.message_id,
                    "visibility timeout expired, redelivering"
                );
                self.ready.push_back(flight.stored);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|(at, _)| *at).min();
        let in_flight = self.in_flight.values().map(|f| f.invisible_until).min();
        match (delayed, in_flight) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// In-memory queue with visibility timeouts, delayed requeue and a dead-letter list
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    available: AtomicBool,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            available: AtomicBool::new(true),
            visibility_timeout,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_VISIBILITY_TIMEOUT)
    }

    /// Enqueue an envelope the way the submission endpoint does
    pub fn submit(&self, envelope: &VoteEnvelope) -> Result<()> {
        let body = envelope.encode()?;
        self.enqueue_raw(&envelope.envelope_id, body)
    }

    /// Enqueue an arbitrary payload under a message id
    pub fn enqueue_raw(&self, message_id: &str, body: Vec<u8>) -> Result<()> {
        {
            let mut state = self.lock()?;
            state.ready.push_back(StoredMessage {
                message_id: message_id.to_string(),
                body,
                delivery_count: 0,
                enqueued_at: Utc::now(),
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            self.notify.notify_waiters();
        }
    }

    /// Return every in-flight delivery to the queue immediately, as if all
    /// visibility timeouts had expired. Returns the number redelivered.
    pub fn expire_in_flight(&self) -> Result<usize> {
        let count = {
            let mut state = self.lock()?;
            let flights: Vec<InFlight> = state.in_flight.drain().map(|(_, f)| f).collect();
            let count = flights.len();
            for flight in flights {
                state.ready.push_back(flight.stored);
            }
            count
        };
        self.notify.notify_waiters();
        Ok(count)
    }

    /// Move every dead letter back onto the queue with a fresh delivery count
    pub fn redrive_dead_letters(&self) -> Result<usize> {
        let count = {
            let mut state = self.lock()?;
            let letters: Vec<DeadLetter> = state.dead_letters.drain(..).collect();
            let count = letters.len();
            for letter in letters {
                state.ready.push_back(StoredMessage {
                    message_id: letter.message.message_id,
                    body: letter.message.body,
                    delivery_count: 0,
                    enqueued_at: letter.message.enqueued_at,
                });
            }
            count
        };
        if count > 0 {
            tracing::info!("📬 Redrove {} dead letters", count);
            self.notify.notify_waiters();
        }
        Ok(count)
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.lock()?.dead_letters.clone())
    }

    /// Messages waiting, delayed, or in flight
    pub fn pending(&self) -> Result<usize> {
        let state = self.lock()?;
        Ok(state.ready.len() + state.delayed.len() + state.in_flight.len())
    }

    pub fn in_flight(&self) -> Result<usize> {
        Ok(self.lock()?.in_flight.len())
    }

    pub fn acked(&self) -> Result<u64> {
        Ok(self.lock()?.acked)
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| Error::internal("Queue state lock poisoned"))
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(queue_error!("in-memory queue marked unavailable"))
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl VoteQueue for InMemoryQueue {
    async fn dequeue(&self, timeout: Duration) -> Result<Option<QueuedMessage>> {
        let deadline = Instant::now() + timeout;

        loop {
            self.ensure_available()?;
            let notified = self.notify.notified();

            let wake_at = {
                let mut state = self.lock()?;
                let now = Instant::now();
                state.promote(now);

                if let Some(mut stored) = state.ready.pop_front() {
                    let delivery = stored.deliver();
                    state.in_flight.insert(
                        delivery.receipt.clone(),
                        InFlight {
                            stored,
                            invisible_until: now + self.visibility_timeout,
                        },
                    );
                    return Ok(Some(delivery));
                }

                if now >= deadline {
                    return Ok(None);
                }
                state.next_wake().map_or(deadline, |at| at.min(deadline))
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.lock()?;
        if state.in_flight.remove(receipt).is_some() {
            state.acked += 1;
        } else {
            tracing::warn!(receipt, "ack for unknown or expired receipt ignored");
        }
        Ok(())
    }

    async fn requeue(&self, receipt: &str, delay: Duration) -> Result<()> {
        self.ensure_available()?;
        {
            let mut state = self.lock()?;
            let Some(flight) = state.in_flight.remove(receipt) else {
                tracing::warn!(receipt, "requeue for unknown or expired receipt ignored");
                return Ok(());
            };

            if delay.is_zero() {
                state.ready.push_back(flight.stored);
            } else {
                state.delayed.push((Instant::now() + delay, flight.stored));
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(&self, message: &QueuedMessage, reason: &DeadLetterReason) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.lock()?;
        state.dead_letters.push(DeadLetter {
            message: message.clone(),
            reason: reason.clone(),
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }
}
