//! Vote tallying pipeline core
//!
//! Consumes vote envelopes from an at-least-once queue, applies each one to a
//! running tally exactly once through a transactional store, and pushes
//! every committed snapshot to live subscribers.

pub mod aggregation;
pub mod backoff;
pub mod config;
pub mod errors;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod retention;
pub mod store;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use errors::{Error, Result};
pub use pipeline::{Pipeline, PipelineHandle, ShutdownReport};
pub use types::{CandidateSet, CommitResult, TallySnapshot, VoteEnvelope};

use config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging from `RUST_LOG`, defaulting to `tally=info`
pub fn init() -> Result<()> {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "tally=info".into()))
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("🗳️  Tally pipeline v{} initialized", VERSION);
    }
    Ok(())
}

/// Initialize logging from configuration
pub fn init_with(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(format!("tally={}", logging.level))
        .map_err(|e| Error::config(format!("invalid log level {}: {}", logging.level, e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match logging.format.as_str() {
        "pretty" => builder.pretty().try_init(),
        _ => builder.compact().try_init(),
    }
    .is_ok();

    if installed {
        tracing::info!("🗳️  Tally pipeline v{} initialized", VERSION);
    }
    Ok(())
}
