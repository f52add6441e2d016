//! Background pruning of the processed-id set
//!
//! Only `processed` rows older than the retention window are removed. Counts
//! and processed markers are never touched, so a pruning pass cannot rewind
//! the tally.

use crate::store::TallyStore;
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct RetentionService {
    store: Arc<dyn TallyStore>,
    retention: Duration,
    prune_interval: Duration,
    stop_signal: watch::Receiver<bool>,
}

impl RetentionService {
    pub fn new(
        store: Arc<dyn TallyStore>,
        retention: Duration,
        prune_interval: Duration,
        stop_signal: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            retention,
            prune_interval,
            stop_signal,
        }
    }

    /// Remove processed ids committed before `now - retention`
    pub async fn prune_once(&self) -> Result<usize> {
        let window = chrono::Duration::from_std(self.retention)
            .map_err(|_| Error::config("dedup retention out of range"))?;
        let cutoff = Utc::now() - window;

        let removed = self.store.prune_processed(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, cutoff = %cutoff, "🧹 Pruned processed envelope ids");
        }
        Ok(removed)
    }

    /// Prune on every interval tick until stopped
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.prune_interval);

        tracing::info!(
            "🧹 Retention service started (retention: {:?}, interval: {:?})",
            self.retention,
            self.prune_interval
        );

        loop {
            if *self.stop_signal.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.prune_once().await {
                        tracing::error!("❌ Processed-id pruning failed: {}", e);
                    }
                }
                _ = self.stop_signal.changed() => {
                    tracing::info!("🛑 Retention service stopping");
                    break;
                }
            }
        }

        tracing::info!("✅ Retention service stopped");
    }
}
