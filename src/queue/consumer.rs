//! Retrying queue consumer
//!
//! Wraps a [`VoteQueue`] with the consumption policy: polls that hit an
//! unavailable queue are retried with exponential backoff indefinitely, and
//! acknowledgement-side operations are retried a bounded number of times.
//! The consumer never touches tally state.

use super::{DeadLetterReason, QueuedMessage, VoteQueue};
use crate::backoff::Backoff;
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Attempts for ack, requeue and dead-letter calls before giving up.
/// A delivery whose ack is lost is redelivered and de-duplicated downstream.
const OPERATION_ATTEMPTS: u32 = 5;

pub struct QueueConsumer {
    queue: Arc<dyn VoteQueue>,
    backoff: Backoff,
    poll_timeout: Duration,
    queue_retries: AtomicU64,
}

impl QueueConsumer {
    pub fn new(queue: Arc<dyn VoteQueue>, backoff: Backoff, poll_timeout: Duration) -> Self {
        Self {
            queue,
            backoff,
            poll_timeout,
            queue_retries: AtomicU64::new(0),
        }
    }

    /// Next message, or `None` when the poll timeout elapses with nothing to do
    ///
    /// Queue unavailability is logged and retried with backoff; it never
    /// surfaces as an error. Dropping the returned future (e.g. on shutdown)
    /// is safe at any suspension point.
    pub async fn poll(&self) -> Result<Option<QueuedMessage>> {
        let mut attempt = 0u32;

        loop {
            match self.queue.dequeue(self.poll_timeout).await {
                Ok(message) => {
                    if attempt > 0 {
                        tracing::info!("✅ Queue reachable again after {} retries", attempt);
                    }
                    return Ok(message);
                }
                Err(e) if e.is_transient() => {
                    attempt = attempt.saturating_add(1);
                    self.queue_retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "⚠️  Queue unavailable: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Acknowledge a delivery. Call only after its commit is confirmed.
    pub async fn acknowledge(&self, message: &QueuedMessage) -> Result<()> {
        self.with_retries("ack", || self.queue.ack(&message.receipt))
            .await
    }

    /// Hand a delivery back to the queue, visible again after `delay`
    pub async fn requeue(&self, message: &QueuedMessage, delay: Duration) -> Result<()> {
        self.with_retries("requeue", || self.queue.requeue(&message.receipt, delay))
            .await
    }

    /// Park a delivery on the dead-letter path and acknowledge it, so it
    /// cannot poison the queue
    pub async fn dead_letter(&self, message: &QueuedMessage, reason: &DeadLetterReason) -> Result<()> {
        self.with_retries("dead_letter", || self.queue.dead_letter(message, reason))
            .await?;
        tracing::warn!(
            message_id = %message.message_id,
            deliveries = message.delivery_count,
            "☠️  Dead-lettered envelope: {}",
            reason
        );
        self.acknowledge(message).await
    }

    /// Transient queue failures observed so far
    pub fn queue_retries(&self) -> u64 {
        self.queue_retries.load(Ordering::Relaxed)
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    async fn with_retries<F, Fut>(&self, operation: &str, mut call: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut last_error: Option<Error> = None;

        for attempt in 1..=OPERATION_ATTEMPTS {
            match call().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    self.queue_retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(operation, attempt, "Queue operation failed: {}", e);
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::internal(format!("{operation} failed"))))
    }
}
