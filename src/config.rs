//! Pipeline configuration
//!
//! Loads settings from environment variables (and a `.env` file if present)
//! with validation. Every duration has a conservative production default.

use crate::types::CandidateSet;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue consumption settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Prefix for consumer ids; worker `n` is `{consumer_id}-{n}`
    pub consumer_id: String,

    /// Number of concurrent consumer workers in this process
    pub workers: usize,

    /// How long a single poll blocks before returning nothing
    pub poll_timeout_ms: u64,

    /// Deliveries of one envelope before it is dead-lettered
    pub max_retries: u32,

    /// How long shutdown waits for in-flight work
    pub drain_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_id: "tally".to_string(),
            workers: 1,
            poll_timeout_ms: 1_000,
            max_retries: 5,
            drain_timeout_ms: 10_000,
        }
    }
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.consumer_id.trim().is_empty() {
            return Err(Error::config("consumer id must not be empty"));
        }
        if self.workers == 0 {
            return Err(Error::config("at least one worker is required"));
        }
        if self.poll_timeout_ms == 0 {
            return Err(Error::config("poll timeout must be positive"));
        }
        if self.max_retries == 0 {
            return Err(Error::config("max retries must be at least 1"));
        }
        Ok(())
    }
}

/// Exponential backoff settings shared by queue and storage retries
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    /// Relative jitter, e.g. 0.2 for ±20%
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 200,
            cap_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_ms == 0 {
            return Err(Error::config("backoff base must be positive"));
        }
        if self.cap_ms < self.base_ms {
            return Err(Error::config("backoff cap must not be below the base"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::config("backoff jitter must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Upper bound on a single commit transaction
    pub commit_timeout_ms: u64,

    /// How long processed envelope ids are kept for de-duplication.
    /// Must exceed the queue's maximum redelivery lag.
    pub dedup_retention_seconds: u64,

    /// How often the retention service prunes processed ids
    pub prune_interval_seconds: u64,

    /// Capacity of each worker's in-memory recent-id window
    pub dedup_window: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            commit_timeout_ms: 5_000,
            dedup_retention_seconds: 7 * 24 * 3600, // 7 days
            prune_interval_seconds: 3600,
            dedup_window: 10_000,
        }
    }
}

impl StorageConfig {
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.dedup_retention_seconds)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_seconds)
    }

    /// Checks this section against the delays a delivery can accumulate
    /// before it is redelivered: the drain timeout plus a capped backoff.
    pub fn validate(&self, consumer: &ConsumerConfig, backoff: &BackoffConfig) -> Result<()> {
        if self.commit_timeout_ms == 0 {
            return Err(Error::config("commit timeout must be positive"));
        }
        if self.prune_interval_seconds == 0 {
            return Err(Error::config("prune interval must be positive"));
        }

        let min_retention_ms = consumer.drain_timeout_ms + backoff.cap_ms;
        if self.dedup_retention_seconds.saturating_mul(1000) <= min_retention_ms {
            return Err(Error::config(format!(
                "dedup retention ({}s) must exceed the redelivery lag ({}ms)",
                self.dedup_retention_seconds, min_retention_ms
            )));
        }
        Ok(())
    }
}

/// Live update settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Buffered updates per subscriber before new ones are dropped
    pub subscriber_buffer: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 16,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub candidates: CandidateSet,
    pub consumer: ConsumerConfig,
    pub backoff: BackoffConfig,
    pub storage: StorageConfig,
    pub publisher: PublisherConfig,
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Default settings for a candidate set
    pub fn new(candidates: CandidateSet) -> Self {
        Self {
            candidates,
            consumer: ConsumerConfig::default(),
            backoff: BackoffConfig::default(),
            storage: StorageConfig::default(),
            publisher: PublisherConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let candidates = lookup("TALLY_CANDIDATES")
            .ok_or_else(|| Error::config("TALLY_CANDIDATES environment variable required"))?;
        let mut config = Self::new(CandidateSet::parse(&candidates)?);

        if let Some(id) = lookup("TALLY_CONSUMER_ID") {
            config.consumer.consumer_id = id;
        }
        config.consumer.workers = parse_or(&lookup, "TALLY_WORKERS", config.consumer.workers)?;
        config.consumer.poll_timeout_ms =
            parse_or(&lookup, "TALLY_POLL_TIMEOUT_MS", config.consumer.poll_timeout_ms)?;
        config.consumer.max_retries =
            parse_or(&lookup, "TALLY_MAX_RETRIES", config.consumer.max_retries)?;
        config.consumer.drain_timeout_ms =
            parse_or(&lookup, "TALLY_DRAIN_TIMEOUT_MS", config.consumer.drain_timeout_ms)?;

        config.backoff.base_ms = parse_or(&lookup, "TALLY_BACKOFF_BASE_MS", config.backoff.base_ms)?;
        config.backoff.cap_ms = parse_or(&lookup, "TALLY_BACKOFF_CAP_MS", config.backoff.cap_ms)?;
        config.backoff.jitter = parse_or(&lookup, "TALLY_BACKOFF_JITTER", config.backoff.jitter)?;

        config.storage.commit_timeout_ms =
            parse_or(&lookup, "TALLY_COMMIT_TIMEOUT_MS", config.storage.commit_timeout_ms)?;
        config.storage.dedup_retention_seconds = parse_or(
            &lookup,
            "TALLY_DEDUP_RETENTION_SECONDS",
            config.storage.dedup_retention_seconds,
        )?;
        config.storage.prune_interval_seconds = parse_or(
            &lookup,
            "TALLY_PRUNE_INTERVAL_SECONDS",
            config.storage.prune_interval_seconds,
        )?;
        config.storage.dedup_window =
            parse_or(&lookup, "TALLY_DEDUP_WINDOW", config.storage.dedup_window)?;

        config.publisher.subscriber_buffer = parse_or(
            &lookup,
            "TALLY_SUBSCRIBER_BUFFER",
            config.publisher.subscriber_buffer,
        )?;

        config.logging = LoggingConfig {
            level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            format: lookup("LOG_FORMAT").unwrap_or_else(|| "compact".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Create configuration for testing
    pub fn for_testing(candidates: &[&str]) -> Result<Self> {
        let mut config = Self::new(CandidateSet::new(candidates.iter().copied())?);

        config.consumer.poll_timeout_ms = 20;
        config.consumer.drain_timeout_ms = 1_000;
        config.backoff = BackoffConfig {
            base_ms: 5,
            cap_ms: 50,
            jitter: 0.2,
        };
        config.storage.commit_timeout_ms = 500;
        config.storage.prune_interval_seconds = 60;
        config.storage.dedup_window = 128;
        config.logging = LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.consumer.validate()?;
        self.backoff.validate()?;
        self.storage.validate(&self.consumer, &self.backoff)?;
        if self.publisher.subscriber_buffer == 0 {
            return Err(Error::config("subscriber buffer must be positive"));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("Invalid {key}: {raw}"))),
        None => Ok(default),
    }
}
