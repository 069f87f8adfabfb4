//! Persistent stores for the ingest pipeline
//!
//! One SQLite database holds both logical stores plus the pipeline
//! bookkeeping: the append-only observation store, the versioned canonical
//! store, recorded normalization failures, work units, sweep cursors, the
//! rule-set registry, and service settings.

pub mod canonical;
pub mod failures;
pub mod observations;
pub mod rulesets;
pub mod settings;
pub mod sweeps;
pub mod works;

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Store-level error taxonomy.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O or database failure; retryable with backoff
    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    /// The (source, ordinal) identity already exists. Extraction is not
    /// re-runnable for the same document; this signals a caller error.
    #[error("duplicate observation ({source_id}, {ordinal})")]
    DuplicateObservation { source_id: Uuid, ordinal: i64 },

    /// A record with the same business key but different content was
    /// written without supersede permission.
    #[error("identity conflict on {record_key}: {detail}")]
    IdentityConflict { record_key: String, detail: String },

    /// The append batch itself is malformed (mixed documents, empty batch)
    #[error("invalid append: {0}")]
    InvalidAppend(String),
}

impl StoreError {
    /// Whether the coordinator should retry this error with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Storage(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Initialize database connection pool.
///
/// Connects to the shared tally.db, creating the file and any missing
/// tables on first use.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Use proper SQLite URI with mode=rwc (read, write, create)
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;

    Ok(pool)
}

/// Create the pipeline tables if they don't exist.
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    // Append-only observation store. The composite primary key enforces
    // observation identity.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS observations (
            source_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            source_type TEXT NOT NULL,
            fields TEXT NOT NULL,
            parser_id TEXT NOT NULL,
            extracted_at TEXT NOT NULL,
            PRIMARY KEY (source_id, ordinal)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Canonical store: every row is one (business key, version) entry;
    // is_current distinguishes the current view from history.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS canonical_records (
            id TEXT PRIMARY KEY,
            record_key TEXT NOT NULL,
            source_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            ruleset_version INTEGER NOT NULL,
            posted_on TEXT NOT NULL,
            amount_minor INTEGER NOT NULL,
            amount_scale INTEGER NOT NULL,
            description TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 1,
            normalized_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_canonical_key ON canonical_records(record_key)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_canonical_observation ON canonical_records(source_id, ordinal)",
    )
    .execute(pool)
    .await?;

    // Recorded per-record normalization failures, keyed per rule-set
    // version so replays stay idempotent.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS normalization_failures (
            source_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            ruleset_version INTEGER NOT NULL,
            reason TEXT NOT NULL,
            field TEXT,
            detail TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            PRIMARY KEY (source_id, ordinal, ruleset_version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Unit-of-work persistence for crash resume
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_units (
            work_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            source_id TEXT NOT NULL,
            state TEXT NOT NULL,
            ruleset_version INTEGER,
            attempts INTEGER NOT NULL DEFAULT 0,
            report TEXT NOT NULL DEFAULT '{}',
            error TEXT,
            started_at TEXT NOT NULL,
            ended_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Re-normalization sweep cursors
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sweeps (
            ruleset_version INTEGER NOT NULL,
            selector TEXT NOT NULL,
            cursor_source_id TEXT,
            cursor_ordinal INTEGER,
            processed INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL DEFAULT 'RUNNING',
            updated_at TEXT NOT NULL,
            PRIMARY KEY (ruleset_version, selector)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only rule-set registry
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rulesets (
            version INTEGER PRIMARY KEY,
            policy TEXT NOT NULL,
            published_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Service settings
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized");

    Ok(())
}

/// Count observations of one document that have a recorded outcome under
/// one rule-set version, counting each ordinal once even if it somehow has
/// both a record and a recorded failure from different runs.
pub async fn count_outcomes(
    pool: &SqlitePool,
    source_id: Uuid,
    ruleset_version: i64,
) -> StoreResult<i64> {
    let source = source_id.to_string();
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM (
            SELECT ordinal FROM canonical_records
             WHERE source_id = ? AND ruleset_version = ?
            UNION
            SELECT ordinal FROM normalization_failures
             WHERE source_id = ? AND ruleset_version = ?
        )
        "#,
    )
    .bind(&source)
    .bind(ruleset_version)
    .bind(&source)
    .bind(ruleset_version)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    // One connection: each new in-memory SQLite connection is a fresh,
    // empty database.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_tables(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_tables_is_idempotent() {
        let pool = memory_pool().await;
        // Second run must not fail on existing tables
        init_tables(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn file_backed_pool_creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("tally.db");
        let pool = init_database_pool(&db_path).await.unwrap();
        drop(pool);
        assert!(db_path.exists());
    }

    #[test]
    fn only_storage_errors_are_retryable() {
        assert!(StoreError::Storage(sqlx::Error::PoolClosed).is_retryable());
        assert!(!StoreError::DuplicateObservation {
            source_id: Uuid::new_v4(),
            ordinal: 0,
        }
        .is_retryable());
        assert!(!StoreError::IdentityConflict {
            record_key: "k".to_string(),
            detail: "d".to_string(),
        }
        .is_retryable());
    }
}
