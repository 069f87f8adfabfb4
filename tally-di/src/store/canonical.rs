//! Canonical store operations
//!
//! Keyed by business identity. The upsert is the serialization point for
//! concurrent normalization runs: identical writes converge as no-ops,
//! newer rule-set versions supersede older ones, and history is never
//! discarded. Every row records the rule-set version that produced it and
//! whether it is the current view of its key.

use crate::models::{Amount, CanonicalRecord};
use crate::store::{StoreError, StoreResult};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// How the upsert resolves a same-key write with different content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertPolicy {
    /// Surface an identity conflict instead of replacing anything
    Reject,
    /// Newer rule-set versions replace the current view; older versions
    /// land in history only
    Supersede,
}

/// Observable effect of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No row existed for the key; written as current
    Inserted,
    /// An identical entry already existed; nothing written
    Unchanged,
    /// A prior current row was demoted to history and this row took over
    Superseded,
    /// A newer version already owns the key; written as history only
    StaleVersion,
}

/// One persisted canonical entry: the record plus storage metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: Uuid,
    pub record: CanonicalRecord,
    pub is_current: bool,
    pub normalized_at: DateTime<Utc>,
}

/// Idempotent versioned upsert keyed by business identity.
///
/// Rules, given an existing entry for the same key:
/// - identical content and version: no-op, no duplicate history entry
/// - different content, same version: identity conflict regardless of
///   policy, because a pure normalizer cannot produce two outputs for one
///   version
/// - different content, `Reject`: identity conflict
/// - different content, `Supersede`, strictly newer version: replaces the
///   current view, prior row kept as history
/// - different content, `Supersede`, older version: appended to history,
///   current view untouched
pub async fn upsert(
    pool: &SqlitePool,
    record: &CanonicalRecord,
    policy: UpsertPolicy,
) -> StoreResult<UpsertOutcome> {
    let mut tx = pool.begin().await?;

    // An identical entry anywhere in the trail makes this write a replay.
    let existing_identical: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT 1 FROM canonical_records
        WHERE record_key = ? AND ruleset_version = ?
          AND source_id = ? AND ordinal = ?
          AND posted_on = ? AND amount_minor = ? AND amount_scale = ?
          AND description = ?
        LIMIT 1
        "#,
    )
    .bind(&record.record_key)
    .bind(record.ruleset_version)
    .bind(record.source_id.to_string())
    .bind(record.ordinal)
    .bind(record.posted_on.to_string())
    .bind(record.amount.minor_units)
    .bind(record.amount.scale as i64)
    .bind(&record.description)
    .fetch_optional(&mut *tx)
    .await?;

    if existing_identical.is_some() {
        return Ok(UpsertOutcome::Unchanged);
    }

    let current = current_row_for_key(&mut tx, &record.record_key).await?;

    let outcome = match &current {
        None => UpsertOutcome::Inserted,
        Some(existing) => {
            if existing.record.ruleset_version == record.ruleset_version {
                // Same version, content differs (the identical check above
                // already passed): purity violation or colliding business
                // identities.
                return Err(StoreError::IdentityConflict {
                    record_key: record.record_key.clone(),
                    detail: format!(
                        "version {} already produced different content for observation ({}, {})",
                        existing.record.ruleset_version,
                        existing.record.source_id,
                        existing.record.ordinal
                    ),
                });
            }

            match policy {
                UpsertPolicy::Reject => {
                    return Err(StoreError::IdentityConflict {
                        record_key: record.record_key.clone(),
                        detail: format!(
                            "existing version {} differs and supersede was not requested",
                            existing.record.ruleset_version
                        ),
                    });
                }
                UpsertPolicy::Supersede => {
                    if record.ruleset_version > existing.record.ruleset_version {
                        UpsertOutcome::Superseded
                    } else {
                        UpsertOutcome::StaleVersion
                    }
                }
            }
        }
    };

    if outcome == UpsertOutcome::Superseded {
        sqlx::query("UPDATE canonical_records SET is_current = 0 WHERE record_key = ? AND is_current = 1")
            .bind(&record.record_key)
            .execute(&mut *tx)
            .await?;
    }

    let is_current = matches!(outcome, UpsertOutcome::Inserted | UpsertOutcome::Superseded);

    sqlx::query(
        r#"
        INSERT INTO canonical_records (
            id, record_key, source_id, ordinal, ruleset_version,
            posted_on, amount_minor, amount_scale, description,
            is_current, normalized_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&record.record_key)
    .bind(record.source_id.to_string())
    .bind(record.ordinal)
    .bind(record.ruleset_version)
    .bind(record.posted_on.to_string())
    .bind(record.amount.minor_units)
    .bind(record.amount.scale as i64)
    .bind(&record.description)
    .bind(is_current as i64)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::debug!(
        record_key = %record.record_key,
        ruleset_version = record.ruleset_version,
        outcome = ?outcome,
        "Canonical upsert"
    );

    Ok(outcome)
}

/// Current view of one business key.
pub async fn current_by_key(pool: &SqlitePool, record_key: &str) -> StoreResult<Option<StoredRecord>> {
    let row = sqlx::query(
        "SELECT * FROM canonical_records WHERE record_key = ? AND is_current = 1",
    )
    .bind(record_key)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(stored_from_row).transpose()
}

/// Full version trail of one business key, oldest version first.
pub async fn history_by_key(pool: &SqlitePool, record_key: &str) -> StoreResult<Vec<StoredRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM canonical_records WHERE record_key = ? ORDER BY ruleset_version, normalized_at",
    )
    .bind(record_key)
    .fetch_all(pool)
    .await?;

    rows.iter().map(stored_from_row).collect()
}

/// All entries that trace back to one observation, newest version first.
pub async fn records_for_observation(
    pool: &SqlitePool,
    source_id: Uuid,
    ordinal: i64,
) -> StoreResult<Vec<StoredRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM canonical_records
        WHERE source_id = ? AND ordinal = ?
        ORDER BY ruleset_version DESC, normalized_at DESC
        "#,
    )
    .bind(source_id.to_string())
    .bind(ordinal)
    .fetch_all(pool)
    .await?;

    rows.iter().map(stored_from_row).collect()
}

/// Current entries that trace back to one observation.
pub async fn current_for_observation(
    pool: &SqlitePool,
    source_id: Uuid,
    ordinal: i64,
) -> StoreResult<Vec<StoredRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM canonical_records
        WHERE source_id = ? AND ordinal = ? AND is_current = 1
        ORDER BY ruleset_version DESC
        "#,
    )
    .bind(source_id.to_string())
    .bind(ordinal)
    .fetch_all(pool)
    .await?;

    rows.iter().map(stored_from_row).collect()
}

/// Demote an observation's current records under business keys other than
/// `keep_key`. Used when re-normalization moves an observation to a new
/// key: the old entries stay in history, the new key owns the current view.
/// Returns how many rows were demoted.
pub async fn supersede_for_observation(
    pool: &SqlitePool,
    source_id: Uuid,
    ordinal: i64,
    keep_key: &str,
) -> StoreResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE canonical_records SET is_current = 0
        WHERE source_id = ? AND ordinal = ? AND is_current = 1 AND record_key != ?
        "#,
    )
    .bind(source_id.to_string())
    .bind(ordinal)
    .bind(keep_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Count canonical entries of one document under one rule-set version.
pub async fn count_for_source_version(
    pool: &SqlitePool,
    source_id: Uuid,
    ruleset_version: i64,
) -> StoreResult<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM canonical_records WHERE source_id = ? AND ruleset_version = ?",
    )
    .bind(source_id.to_string())
    .bind(ruleset_version)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

async fn current_row_for_key(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    record_key: &str,
) -> StoreResult<Option<StoredRecord>> {
    let row = sqlx::query(
        "SELECT * FROM canonical_records WHERE record_key = ? AND is_current = 1",
    )
    .bind(record_key)
    .fetch_optional(&mut **tx)
    .await?;

    row.as_ref().map(stored_from_row).transpose()
}

fn stored_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<StoredRecord> {
    let decode = |what: &str, detail: String| {
        StoreError::Storage(sqlx::Error::Decode(
            format!("undecodable {}: {}", what, detail).into(),
        ))
    };

    let id = Uuid::parse_str(row.get::<String, _>("id").as_str())
        .map_err(|e| decode("id", e.to_string()))?;
    let source_id = Uuid::parse_str(row.get::<String, _>("source_id").as_str())
        .map_err(|e| decode("source_id", e.to_string()))?;
    let posted_on_raw: String = row.get("posted_on");
    let posted_on: NaiveDate = posted_on_raw
        .parse()
        .map_err(|_| decode("posted_on", posted_on_raw.clone()))?;
    let normalized_at_raw: String = row.get("normalized_at");
    let normalized_at = DateTime::parse_from_rfc3339(&normalized_at_raw)
        .map_err(|e| decode("normalized_at", e.to_string()))?
        .with_timezone(&Utc);

    Ok(StoredRecord {
        id,
        record: CanonicalRecord {
            record_key: row.get("record_key"),
            posted_on,
            amount: Amount::new(
                row.get::<i64, _>("amount_minor"),
                row.get::<i64, _>("amount_scale") as u8,
            ),
            description: row.get("description"),
            source_id,
            ordinal: row.get("ordinal"),
            ruleset_version: row.get("ruleset_version"),
        },
        is_current: row.get::<i64, _>("is_current") != 0,
        normalized_at,
    })
}
