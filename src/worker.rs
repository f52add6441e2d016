//! Consumer worker: one queue consumer driving one aggregation engine
//!
//! Per delivery, strictly in dequeue order:
//! 1. admit the payload (validate, local duplicate check)
//! 2. commit it transactionally
//! 3. acknowledge the delivery, only after the commit is confirmed
//! 4. broadcast the committed snapshot
//!
//! Failures are contained per delivery and never end the loop.

use crate::aggregation::{Admission, AggregationEngine, EnvelopeState, Rejection, StagedWrite};
use crate::publisher::UpdatePublisher;
use crate::queue::{DeadLetterReason, QueueConsumer, QueuedMessage};
use crate::store::TallyStore;
use crate::types::{CommitResult, TallySnapshot};
use crate::{Error, Result, storage_error};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied {
        option: String,
        new_total: u64,
        version: u64,
    },
    Duplicate,
    DeadLettered(DeadLetterReason),
    Requeued {
        delay: Duration,
        delivery: u32,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub received: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
    pub queue_retries: u64,
}

/// Final state of a worker that stopped on its own
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub consumer_id: String,
    pub stats: WorkerStats,
    pub last_snapshot: TallySnapshot,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Deliveries of one envelope before it is dead-lettered
    pub max_retries: u32,
    pub commit_timeout: Duration,
}

pub struct ConsumerWorker {
    consumer_id: String,
    consumer: QueueConsumer,
    engine: AggregationEngine,
    store: Arc<dyn TallyStore>,
    publisher: Arc<UpdatePublisher>,
    settings: WorkerSettings,
    stats: WorkerStats,
    /// Consecutive deliveries that failed on storage
    storage_failures: u32,
}

impl ConsumerWorker {
    pub fn new(
        consumer_id: impl Into<String>,
        consumer: QueueConsumer,
        engine: AggregationEngine,
        store: Arc<dyn TallyStore>,
        publisher: Arc<UpdatePublisher>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            consumer,
            engine,
            store,
            publisher,
            settings,
            stats: WorkerStats::default(),
            storage_failures: 0,
        }
    }

    /// Consume until `stop` flips to `true`
    ///
    /// The stop signal is only observed between deliveries and while idle:
    /// a delivery that has been dequeued is always processed to completion.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> WorkerReport {
        tracing::info!(consumer = %self.consumer_id, "🚀 Consumer worker started");

        loop {
            if *stop.borrow() {
                break;
            }

            if self.storage_failures > 0 {
                let pause = self.consumer.backoff().delay(self.storage_failures);
                tracing::warn!(
                    consumer = %self.consumer_id,
                    pause_ms = pause.as_millis() as u64,
                    "⏸️  Pausing after storage failure"
                );
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = stop.changed() => break,
                }
            }

            let polled = tokio::select! {
                biased;
                _ = stop.changed() => break,
                polled = self.consumer.poll() => polled,
            };

            match polled {
                Ok(Some(message)) => {
                    if let Err(e) = self.process(message).await {
                        tracing::error!(consumer = %self.consumer_id, "❌ Delivery left unacknowledged: {}", e);
                    }
                }
                Ok(None) => self.storage_failures = 0,
                Err(e) => {
                    tracing::error!(consumer = %self.consumer_id, "❌ Poll failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.consumer.backoff().delay(1)) => {}
                        _ = stop.changed() => break,
                    }
                }
            }
        }

        self.stats.queue_retries = self.consumer.queue_retries();
        tracing::info!(
            consumer = %self.consumer_id,
            applied = self.stats.applied,
            duplicates = self.stats.duplicates,
            dead_lettered = self.stats.dead_lettered,
            "✅ Consumer worker stopped"
        );

        WorkerReport {
            consumer_id: self.consumer_id,
            stats: self.stats,
            last_snapshot: self.engine.snapshot().clone(),
        }
    }

    /// Handle one delivery end to end
    ///
    /// An `Err` means the delivery could not even be acknowledged, requeued
    /// or dead-lettered; the queue will redeliver it.
    pub async fn process(&mut self, message: QueuedMessage) -> Result<Outcome> {
        self.stats.received += 1;

        let staged = match self.engine.admit(&message.body) {
            Admission::Staged(staged) => staged,
            Admission::Rejected(Rejection::Duplicate) => {
                tracing::debug!(message_id = %message.message_id, "Duplicate dropped from local window");
                self.consumer.acknowledge(&message).await?;
                self.stats.duplicates += 1;
                return Ok(Outcome::Duplicate);
            }
            Admission::Rejected(rejection) => {
                let reason = rejection
                    .dead_letter_reason()
                    .unwrap_or_else(|| DeadLetterReason::InvalidEnvelope(rejection.to_string()));
                return self.dead_letter(&message, reason).await;
            }
        };

        if staged.envelope_id() != message.message_id {
            tracing::warn!(
                message_id = %message.message_id,
                envelope_id = %staged.envelope_id(),
                "Queue message id differs from envelope id; de-duplicating on envelope id"
            );
        }

        match self.commit(&staged).await {
            Ok(result) => {
                self.storage_failures = 0;
                self.finish_commit(&message, &staged, result).await
            }
            Err(Error::ConstraintViolation { message: detail }) => {
                self.storage_failures = 0;
                self.dead_letter(&message, DeadLetterReason::ConstraintViolation(detail))
                    .await
            }
            Err(e) => {
                if e.is_transient() {
                    self.storage_failures = self.storage_failures.saturating_add(1);
                }
                self.retry_later(&message, e).await
            }
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    async fn commit(&self, staged: &StagedWrite) -> Result<CommitResult> {
        let commit = self
            .store
            .commit(&self.consumer_id, staged.envelope_id(), staged.option());

        if let Ok(result) = tokio::time::timeout(self.settings.commit_timeout, commit).await {
            return result;
        }

        // The transaction may have committed even though the reply never
        // arrived; only the processed set can tell.
        let landed = tokio::time::timeout(
            self.settings.commit_timeout,
            self.store.is_processed(staged.envelope_id()),
        )
        .await;
        match landed {
            Ok(Ok(true)) => {
                tracing::info!(envelope_id = %staged.envelope_id(), "Commit landed after its timeout");
                Ok(CommitResult::AlreadyProcessed)
            }
            _ => Err(storage_error!(
                "commit timed out after {}ms",
                self.settings.commit_timeout.as_millis()
            )),
        }
    }

    /// Catch up with a commit whose snapshot this worker never received
    async fn refresh(&mut self) {
        let loaded = tokio::time::timeout(self.settings.commit_timeout, self.store.load_snapshot()).await;
        match loaded {
            Ok(Ok(snapshot)) => {
                self.engine.reconcile(&snapshot);
                self.publish(snapshot);
            }
            Ok(Err(e)) => tracing::warn!("⚠️  Snapshot refresh failed: {}", e),
            Err(_) => tracing::warn!("⚠️  Snapshot refresh timed out"),
        }
    }

    async fn finish_commit(
        &mut self,
        message: &QueuedMessage,
        staged: &StagedWrite,
        result: CommitResult,
    ) -> Result<Outcome> {
        let state = self.engine.apply(staged, &result);
        let acked = self.consumer.acknowledge(message).await;

        match result {
            CommitResult::Committed { new_total, snapshot } => {
                debug_assert_eq!(state, EnvelopeState::Applied);
                let version = snapshot.version;
                self.publish(snapshot);
                acked?;

                self.stats.applied += 1;
                tracing::debug!(
                    consumer = %self.consumer_id,
                    envelope_id = %staged.envelope_id(),
                    option = %staged.option(),
                    new_total,
                    version,
                    "Vote committed"
                );
                Ok(Outcome::Applied {
                    option: staged.option().to_string(),
                    new_total,
                    version,
                })
            }
            CommitResult::AlreadyProcessed => {
                // Whoever committed it may not have broadcast the result
                self.refresh().await;
                acked?;
                self.stats.duplicates += 1;
                tracing::debug!(envelope_id = %staged.envelope_id(), "Redelivered envelope already committed");
                Ok(Outcome::Duplicate)
            }
        }
    }

    async fn retry_later(&mut self, message: &QueuedMessage, error: Error) -> Result<Outcome> {
        if message.delivery_count >= self.settings.max_retries {
            let reason = DeadLetterReason::RetriesExhausted {
                attempts: message.delivery_count,
                last_error: error.to_string(),
            };
            return self.dead_letter(message, reason).await;
        }

        let delay = self.consumer.backoff().delay(message.delivery_count);
        tracing::warn!(
            consumer = %self.consumer_id,
            message_id = %message.message_id,
            delivery = message.delivery_count,
            delay_ms = delay.as_millis() as u64,
            "🔁 Commit failed, requeueing: {}",
            error
        );
        self.consumer.requeue(message, delay).await?;
        self.stats.requeued += 1;

        Ok(Outcome::Requeued {
            delay,
            delivery: message.delivery_count,
        })
    }

    async fn dead_letter(&mut self, message: &QueuedMessage, reason: DeadLetterReason) -> Result<Outcome> {
        self.consumer.dead_letter(message, &reason).await?;
        self.stats.dead_lettered += 1;
        Ok(Outcome::DeadLettered(reason))
    }

    /// Fire-and-forget; a publishing problem never fails the commit path
    fn publish(&self, snapshot: TallySnapshot) {
        match self.publisher.broadcast(snapshot) {
            Ok(report) => {
                if report.disconnected > 0 {
                    tracing::debug!(disconnected = report.disconnected, "Pruned closed subscribers");
                }
            }
            Err(e) => tracing::warn!("⚠️  Broadcast failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::config::BackoffConfig;
    use crate::queue::{InMemoryQueue, VoteQueue};
    use crate::store::InMemoryTallyStore;
    use crate::types::{CandidateSet, VoteEnvelope};

    struct Harness {
        queue: Arc<InMemoryQueue>,
        store: Arc<InMemoryTallyStore>,
        publisher: Arc<UpdatePublisher>,
        worker: ConsumerWorker,
    }

    fn harness(max_retries: u32) -> Harness {
        let candidates = CandidateSet::new(["A", "B"]).unwrap();
        let queue = Arc::new(InMemoryQueue::with_defaults());
        let store = Arc::new(InMemoryTallyStore::new(&candidates));
        let snapshot = TallySnapshot::empty(&candidates);
        let publisher = Arc::new(UpdatePublisher::new(snapshot.clone(), 8));

        let backoff = Backoff::new(&BackoffConfig {
            base_ms: 1,
            cap_ms: 4,
            jitter: 0.0,
        });
        let queue_dyn: Arc<dyn VoteQueue> = queue.clone();
        let consumer = QueueConsumer::new(queue_dyn, backoff, Duration::from_millis(5));
        let engine = AggregationEngine::new(candidates, snapshot, 16);
        let worker = ConsumerWorker::new(
            "test-0",
            consumer,
            engine,
            store.clone(),
            publisher.clone(),
            WorkerSettings {
                max_retries,
                commit_timeout: Duration::from_millis(200),
            },
        );

        Harness {
            queue,
            store,
            publisher,
            worker,
        }
    }

    async fn next(queue: &InMemoryQueue) -> QueuedMessage {
        queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_commit_then_ack_then_publish() {
        let mut h = harness(5);
        let mut sub = h.publisher.subscribe().unwrap();
        assert_eq!(sub.recv().await.unwrap().version, 0);

        h.queue.submit(&VoteEnvelope::with_id("1", "v", "A")).unwrap();
        let outcome = h.worker.process(next(&h.queue).await).await.unwrap();

        assert_eq!(
            outcome,
            Outcome::Applied {
                option: "A".into(),
                new_total: 1,
                version: 1
            }
        );
        assert_eq!(h.queue.acked().unwrap(), 1);
        assert_eq!(sub.recv().await.unwrap().count("A"), 1);
    }

    #[tokio::test]
    async fn test_invalid_payloads_dead_lettered_and_acked() {
        let mut h = harness(5);
        h.queue.enqueue_raw("x", b"{\"voter_id\":\"v\"}".to_vec()).unwrap();
        h.queue.submit(&VoteEnvelope::with_id("2", "v", "Z")).unwrap();

        let first = h.worker.process(next(&h.queue).await).await.unwrap();
        assert!(matches!(first, Outcome::DeadLettered(DeadLetterReason::InvalidEnvelope(_))));
        let second = h.worker.process(next(&h.queue).await).await.unwrap();
        assert_eq!(second, Outcome::DeadLettered(DeadLetterReason::InvalidOption("Z".into())));

        assert_eq!(h.queue.dead_letters().unwrap().len(), 2);
        assert_eq!(h.queue.pending().unwrap(), 0);
        assert_eq!(h.store.load_snapshot().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_storage_outage_requeues_then_dead_letters() {
        let mut h = harness(2);
        h.store.faults().set_unavailable(true);
        h.queue.submit(&VoteEnvelope::with_id("1", "v", "A")).unwrap();

        let first = h.worker.process(next(&h.queue).await).await.unwrap();
        assert!(matches!(first, Outcome::Requeued { delivery: 1, .. }));
        assert_eq!(h.queue.acked().unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = h.worker.process(next(&h.queue).await).await.unwrap();
        assert!(matches!(
            second,
            Outcome::DeadLettered(DeadLetterReason::RetriesExhausted { attempts: 2, .. })
        ));
        assert_eq!(h.worker.stats().requeued, 1);
        assert_eq!(h.worker.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_redelivery_after_commit_is_duplicate() {
        let mut h = harness(5);
        h.queue.submit(&VoteEnvelope::with_id("1", "v", "A")).unwrap();
        h.queue.submit(&VoteEnvelope::with_id("1", "v", "A")).unwrap();

        h.worker.process(next(&h.queue).await).await.unwrap();
        let again = h.worker.process(next(&h.queue).await).await.unwrap();

        assert_eq!(again, Outcome::Duplicate);
        assert_eq!(h.store.load_snapshot().await.unwrap().count("A"), 1);
        assert_eq!(h.queue.acked().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_whitespace_in_identifiers_is_significant() {
        let mut h = harness(5);
        h.queue.submit(&VoteEnvelope::with_id("1", "v1", "A")).unwrap();
        h.queue.submit(&VoteEnvelope::with_id("1 ", "v2", "A")).unwrap();
        h.queue.submit(&VoteEnvelope::with_id("3", "v3", " A")).unwrap();

        let first = h.worker.process(next(&h.queue).await).await.unwrap();
        let second = h.worker.process(next(&h.queue).await).await.unwrap();
        let third = h.worker.process(next(&h.queue).await).await.unwrap();

        assert!(matches!(first, Outcome::Applied { new_total: 1, .. }));
        assert!(matches!(second, Outcome::Applied { new_total: 2, .. }));
        assert_eq!(third, Outcome::DeadLettered(DeadLetterReason::InvalidOption(" A".into())));
        assert_eq!(h.store.load_snapshot().await.unwrap().count("A"), 2);
        assert_eq!(h.store.processed_len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_commit_landing_after_timeout_is_published() {
        let mut h = harness(5);
        let mut sub = h.publisher.subscribe().unwrap();
        assert_eq!(sub.recv().await.unwrap().version, 0);

        // Applied in the store, but the reply outlives the commit timeout
        h.store.faults().set_response_latency(Duration::from_millis(400));
        h.queue.submit(&VoteEnvelope::with_id("1", "v", "A")).unwrap();
        let outcome = h.worker.process(next(&h.queue).await).await.unwrap();

        assert_eq!(outcome, Outcome::Duplicate);
        assert_eq!(h.queue.acked().unwrap(), 1);
        assert_eq!(h.queue.pending().unwrap(), 0);

        let published = sub.recv().await.unwrap();
        assert_eq!(published.version, 1);
        assert_eq!(published.count("A"), 1);
        assert_eq!(h.worker.engine().snapshot().version, 1);
    }

    #[tokio::test]
    async fn test_already_processed_refreshes_snapshot() {
        let mut h = harness(5);
        let mut sub = h.publisher.subscribe().unwrap();
        assert_eq!(sub.recv().await.unwrap().version, 0);

        // Committed by another process that never broadcast here
        h.store.commit("elsewhere", "1", "B").await.unwrap();
        h.queue.submit(&VoteEnvelope::with_id("1", "v", "B")).unwrap();
        let outcome = h.worker.process(next(&h.queue).await).await.unwrap();

        assert_eq!(outcome, Outcome::Duplicate);
        assert_eq!(sub.recv().await.unwrap().count("B"), 1);
        assert_eq!(h.publisher.current().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let h = harness(5);
        h.queue.submit(&VoteEnvelope::with_id("1", "v", "B")).unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(h.worker.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        let report = handle.await.unwrap();

        assert_eq!(report.stats.applied, 1);
        assert_eq!(report.last_snapshot.count("B"), 1);
    }
}
