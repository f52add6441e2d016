//! Pipeline assembly and lifecycle
//!
//! Wires the queue and store collaborators to `workers` consumer tasks, one
//! shared publisher and the retention service, all stopped by one watch
//! signal.

use crate::aggregation::AggregationEngine;
use crate::backoff::Backoff;
use crate::config::PipelineConfig;
use crate::publisher::{Subscription, UpdatePublisher};
use crate::queue::{QueueConsumer, VoteQueue};
use crate::retention::RetentionService;
use crate::store::TallyStore;
use crate::types::TallySnapshot;
use crate::worker::{ConsumerWorker, WorkerReport, WorkerSettings, WorkerStats};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Outcome of a graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Workers that finished their in-flight delivery and stopped
    pub drained: usize,
    /// Workers aborted at the drain deadline; their delivery is redelivered
    /// by the queue's visibility timeout
    pub abandoned: usize,
    /// Counters summed over drained workers
    pub stats: WorkerStats,
    pub workers: Vec<WorkerReport>,
    pub final_snapshot: Arc<TallySnapshot>,
}

pub struct Pipeline;

impl Pipeline {
    /// Recover state from the store and start consuming
    pub async fn start(
        config: &PipelineConfig,
        queue: Arc<dyn VoteQueue>,
        store: Arc<dyn TallyStore>,
    ) -> Result<PipelineHandle> {
        config.validate()?;

        let snapshot = store.load_snapshot().await?;
        let publisher = Arc::new(UpdatePublisher::new(
            snapshot,
            config.publisher.subscriber_buffer,
        ));

        let (stop, stop_signal) = watch::channel(false);
        let backoff = Backoff::new(&config.backoff);
        let settings = WorkerSettings {
            max_retries: config.consumer.max_retries,
            commit_timeout: config.storage.commit_timeout(),
        };

        let mut workers = Vec::with_capacity(config.consumer.workers);
        for n in 0..config.consumer.workers {
            let engine = AggregationEngine::recover(
                config.candidates.clone(),
                store.as_ref(),
                config.storage.dedup_window,
            )
            .await?;
            let consumer = QueueConsumer::new(queue.clone(), backoff, config.consumer.poll_timeout());
            let worker = ConsumerWorker::new(
                format!("{}-{}", config.consumer.consumer_id, n),
                consumer,
                engine,
                store.clone(),
                publisher.clone(),
                settings,
            );
            workers.push(tokio::spawn(worker.run(stop_signal.clone())));
        }

        let retention = RetentionService::new(
            store.clone(),
            config.storage.dedup_retention(),
            config.storage.prune_interval(),
            stop_signal,
        );
        let retention = tokio::spawn(retention.run());

        tracing::info!(
            workers = config.consumer.workers,
            candidates = config.candidates.len(),
            "🗳️  Tally pipeline started"
        );

        Ok(PipelineHandle {
            stop,
            workers,
            retention,
            publisher,
            store,
            refresh_timeout: config.storage.commit_timeout(),
            drain_timeout: config.consumer.drain_timeout(),
        })
    }
}

/// Running pipeline
pub struct PipelineHandle {
    stop: watch::Sender<bool>,
    workers: Vec<JoinHandle<WorkerReport>>,
    retention: JoinHandle<()>,
    publisher: Arc<UpdatePublisher>,
    store: Arc<dyn TallyStore>,
    refresh_timeout: Duration,
    drain_timeout: Duration,
}

impl PipelineHandle {
    pub fn publisher(&self) -> Arc<UpdatePublisher> {
        self.publisher.clone()
    }

    /// Subscribe to live updates, starting from the latest stored tally
    ///
    /// Another process sharing the store may have committed since the last
    /// local broadcast, so the stored snapshot is loaded and broadcast first.
    /// If the store cannot answer in time the subscriber starts from the last
    /// local snapshot instead.
    pub async fn subscribe(&self) -> Result<Subscription> {
        match tokio::time::timeout(self.refresh_timeout, self.store.load_snapshot()).await {
            Ok(Ok(snapshot)) => {
                self.publisher.broadcast(snapshot)?;
            }
            Ok(Err(e)) => tracing::warn!("⚠️  Subscribing from local snapshot, store refresh failed: {}", e),
            Err(_) => tracing::warn!("⚠️  Subscribing from local snapshot, store refresh timed out"),
        }
        self.publisher.subscribe()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop polling, let in-flight deliveries finish, abort stragglers
    ///
    /// No worker is interrupted between commit and acknowledge unless the
    /// drain timeout expires first; in that case the unacknowledged delivery
    /// is redelivered and deduplicated by the store.
    pub async fn shutdown(self) -> Result<ShutdownReport> {
        tracing::info!("🛑 Tally pipeline stopping (drain timeout: {:?})", self.drain_timeout);
        // Receivers only go away once every task has finished
        let _ = self.stop.send(true);

        let deadline = Instant::now() + self.drain_timeout;
        let mut reports = Vec::with_capacity(self.workers.len());
        let mut abandoned = 0;

        for mut handle in self.workers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    tracing::error!("❌ Consumer worker failed: {}", e);
                    abandoned += 1;
                }
                Err(_) => {
                    handle.abort();
                    tracing::warn!("⚠️  Consumer worker did not drain in time, aborted");
                    abandoned += 1;
                }
            }
        }

        let mut retention = self.retention;
        if tokio::time::timeout_at(deadline, &mut retention).await.is_err() {
            retention.abort();
        }

        let stats = reports.iter().fold(WorkerStats::default(), |mut total, report| {
            total.received += report.stats.received;
            total.applied += report.stats.applied;
            total.duplicates += report.stats.duplicates;
            total.dead_lettered += report.stats.dead_lettered;
            total.requeued += report.stats.requeued;
            total.queue_retries += report.stats.queue_retries;
            total
        });
        let final_snapshot = self.publisher.current()?;
        self.publisher.close()?;

        tracing::info!(
            drained = reports.len(),
            abandoned,
            applied = stats.applied,
            version = final_snapshot.version,
            "✅ Tally pipeline stopped"
        );

        Ok(ShutdownReport {
            drained: reports.len(),
            abandoned,
            stats,
            workers: reports,
            final_snapshot,
        })
    }
}
