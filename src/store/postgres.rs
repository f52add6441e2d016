//! Postgres-backed tally store
//!
//! Schema (created by [`PostgresTallyStore::migrate`]):
//!
//! ```sql
//! tally(option TEXT PRIMARY KEY, count BIGINT NOT NULL CHECK (count >= 0))
//! processed(envelope_id TEXT PRIMARY KEY, consumer_id TEXT NOT NULL, committed_at TIMESTAMPTZ NOT NULL)
//! tally_meta(id SMALLINT PRIMARY KEY CHECK (id = 1), version BIGINT NOT NULL)
//! processed_marker(consumer_id TEXT PRIMARY KEY, last_envelope_id TEXT NOT NULL,
//!                  last_version BIGINT NOT NULL, commits BIGINT NOT NULL, updated_at TIMESTAMPTZ NOT NULL)
//! ```
//!
//! The `processed` insert with `ON CONFLICT DO NOTHING` is the atomic
//! membership guard: a concurrent transaction inserting the same id blocks
//! until the first one finishes and then observes the conflict. The
//! `tally_meta` row lock serializes commits so the snapshot read inside the
//! transaction is the exact post-commit state.

use super::TallyStore;
use crate::types::{CandidateSet, CommitResult, ProcessedMarker, TallySnapshot};
use crate::{Error, Result, storage_error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::error::ErrorKind;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::BTreeMap;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS tally (
        option TEXT PRIMARY KEY,
        count BIGINT NOT NULL DEFAULT 0 CHECK (count >= 0)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS processed (
        envelope_id TEXT PRIMARY KEY,
        consumer_id TEXT NOT NULL,
        committed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_processed_committed_at ON processed (committed_at)"#,
    r#"CREATE TABLE IF NOT EXISTS tally_meta (
        id SMALLINT PRIMARY KEY CHECK (id = 1),
        version BIGINT NOT NULL DEFAULT 0
    )"#,
    r#"INSERT INTO tally_meta (id, version) VALUES (1, 0) ON CONFLICT (id) DO NOTHING"#,
    r#"CREATE TABLE IF NOT EXISTS processed_marker (
        consumer_id TEXT PRIMARY KEY,
        last_envelope_id TEXT NOT NULL,
        last_version BIGINT NOT NULL,
        commits BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )"#,
];

#[derive(Clone)]
pub struct PostgresTallyStore {
    pool: PgPool,
}

impl PostgresTallyStore {
    /// Connect to an existing pool and verify it answers
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| storage_error!("Tally store failed Postgres health check: {}", e))?;
        tracing::info!("Tally store connected to Postgres");
        Ok(Self { pool })
    }

    /// Create tables if missing and seed a zero row per candidate
    pub async fn migrate(&self, candidates: &CandidateSet) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .map_err(classify)?;
        }

        for option in candidates.iter() {
            sqlx::query("INSERT INTO tally (option, count) VALUES ($1, 0) ON CONFLICT (option) DO NOTHING")
                .bind(option)
                .execute(&self.pool)
                .await
                .map_err(classify)?;
        }
        Ok(())
    }

    async fn read_snapshot(tx: &mut Transaction<'_, Postgres>, version: i64) -> Result<TallySnapshot> {
        let rows = sqlx::query("SELECT option, count FROM tally ORDER BY option")
            .fetch_all(&mut **tx)
            .await
            .map_err(classify)?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let option: String = row.try_get("option").map_err(classify)?;
            let count: i64 = row.try_get("count").map_err(classify)?;
            counts.insert(option, to_u64(count)?);
        }

        Ok(TallySnapshot {
            counts,
            version: to_u64(version)?,
            taken_at: Utc::now(),
        })
    }
}

#[async_trait]
impl TallyStore for PostgresTallyStore {
    async fn commit(&self, consumer_id: &str, envelope_id: &str, option: &str) -> Result<CommitResult> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let inserted = sqlx::query(
            "INSERT INTO processed (envelope_id, consumer_id, committed_at) VALUES ($1, $2, NOW())
             ON CONFLICT (envelope_id) DO NOTHING",
        )
        .bind(envelope_id)
        .bind(consumer_id)
        .execute(&mut *tx)
        .await
        .map_err(classify)?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(classify)?;
            return Ok(CommitResult::AlreadyProcessed);
        }

        let version: i64 = sqlx::query_scalar(
            "UPDATE tally_meta SET version = version + 1 WHERE id = 1 RETURNING version",
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(classify)?;

        let new_total: Option<i64> = sqlx::query_scalar(
            "UPDATE tally SET count = count + 1 WHERE option = $1 RETURNING count",
        )
        .bind(option)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify)?;

        let Some(new_total) = new_total else {
            tx.rollback().await.map_err(classify)?;
            return Err(Error::constraint_violation(format!(
                "no tally row for option {option}"
            )));
        };

        sqlx::query(
            r#"
            INSERT INTO processed_marker (consumer_id, last_envelope_id, last_version, commits, updated_at)
            VALUES ($1, $2, $3, 1, NOW())
            ON CONFLICT (consumer_id) DO UPDATE
            SET last_envelope_id = CASE WHEN EXCLUDED.last_version > processed_marker.last_version
                                        THEN EXCLUDED.last_envelope_id
                                        ELSE processed_marker.last_envelope_id END,
                last_version = GREATEST(processed_marker.last_version, EXCLUDED.last_version),
                commits = processed_marker.commits + 1,
                updated_at = NOW()
            "#,
        )
        .bind(consumer_id)
        .bind(envelope_id)
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        let snapshot = Self::read_snapshot(&mut tx, version).await?;
        tx.commit().await.map_err(classify)?;

        Ok(CommitResult::Committed {
            new_total: to_u64(new_total)?,
            snapshot,
        })
    }

    async fn load_snapshot(&self) -> Result<TallySnapshot> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        let version: i64 = sqlx::query_scalar("SELECT version FROM tally_meta WHERE id = 1 FOR SHARE")
            .fetch_one(&mut *tx)
            .await
            .map_err(classify)?;
        let snapshot = Self::read_snapshot(&mut tx, version).await?;
        tx.commit().await.map_err(classify)?;
        Ok(snapshot)
    }

    async fn processed_marker(&self, consumer_id: &str) -> Result<Option<ProcessedMarker>> {
        let row = sqlx::query(
            "SELECT consumer_id, last_envelope_id, last_version, commits, updated_at
             FROM processed_marker WHERE consumer_id = $1",
        )
        .bind(consumer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ProcessedMarker {
            consumer_id: row.try_get("consumer_id").map_err(classify)?,
            last_envelope_id: row.try_get("last_envelope_id").map_err(classify)?,
            last_version: to_u64(row.try_get("last_version").map_err(classify)?)?,
            commits: to_u64(row.try_get("commits").map_err(classify)?)?,
            updated_at: row.try_get("updated_at").map_err(classify)?,
        }))
    }

    async fn is_processed(&self, envelope_id: &str) -> Result<bool> {
        let found: Option<i32> = sqlx::query_scalar("SELECT 1 FROM processed WHERE envelope_id = $1")
            .bind(envelope_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;
        Ok(found.is_some())
    }

    async fn prune_processed(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = sqlx::query("DELETE FROM processed WHERE committed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(classify)?
            .rows_affected();
        Ok(removed as usize)
    }
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::internal(format!("negative value {value} in tally store")))
}

/// Integrity errors are fatal for the envelope; everything else is retryable
fn classify(err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::Database(db) => match db.kind() {
            ErrorKind::UniqueViolation
            | ErrorKind::ForeignKeyViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::CheckViolation => Error::constraint_violation(db.message().to_string()),
            _ => storage_error!("database error: {}", err),
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::TypeNotFound { .. } => {
            Error::internal(format!("tally schema mismatch: {err}"))
        }
        _ => storage_error!("{}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_transient() {
        assert!(classify(sqlx::Error::PoolTimedOut).is_transient());
        assert!(classify(sqlx::Error::PoolClosed).is_transient());
        assert!(!classify(sqlx::Error::ColumnNotFound("count".into())).is_transient());
    }

    #[test]
    fn test_negative_counts_rejected() {
        assert_eq!(to_u64(3).unwrap(), 3);
        assert!(to_u64(-1).is_err());
    }
}
