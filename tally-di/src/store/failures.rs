//! Recorded normalization failures
//!
//! Failures are outcomes, not exceptions: each one is persisted per
//! (observation, rule-set version) so a unit of work can prove that every
//! observation has been accounted for. Recording is idempotent, which
//! keeps crash-resumed runs from double-counting.

use crate::models::{FailureReason, NormalizationFailure, RecordFailure};
use crate::store::{StoreError, StoreResult};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Record one failure outcome. Replays of the same (observation, version)
/// keep the first recording.
pub async fn record(
    pool: &SqlitePool,
    source_id: Uuid,
    ordinal: i64,
    ruleset_version: i64,
    failure: &NormalizationFailure,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO normalization_failures (
            source_id, ordinal, ruleset_version, reason, field, detail, recorded_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(source_id.to_string())
    .bind(ordinal)
    .bind(ruleset_version)
    .bind(failure.reason.code())
    .bind(&failure.field)
    .bind(&failure.detail)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// All recorded failures of one document under one rule-set version, in
/// ordinal order.
pub async fn for_source_version(
    pool: &SqlitePool,
    source_id: Uuid,
    ruleset_version: i64,
) -> StoreResult<Vec<RecordFailure>> {
    let rows = sqlx::query(
        r#"
        SELECT ordinal, reason, field, detail
        FROM normalization_failures
        WHERE source_id = ? AND ruleset_version = ?
        ORDER BY ordinal
        "#,
    )
    .bind(source_id.to_string())
    .bind(ruleset_version)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let reason_raw: String = row.get("reason");
            let reason = FailureReason::parse(&reason_raw).ok_or_else(|| {
                StoreError::Storage(sqlx::Error::Decode(
                    format!("unknown failure reason {:?}", reason_raw).into(),
                ))
            })?;
            Ok(RecordFailure {
                ordinal: row.get("ordinal"),
                reason,
                field: row.get("field"),
                detail: row.get("detail"),
            })
        })
        .collect()
}

/// Count recorded failures of one document under one rule-set version.
pub async fn count_for_source_version(
    pool: &SqlitePool,
    source_id: Uuid,
    ruleset_version: i64,
) -> StoreResult<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM normalization_failures WHERE source_id = ? AND ruleset_version = ?",
    )
    .bind(source_id.to_string())
    .bind(ruleset_version)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory_pool;

    #[tokio::test]
    async fn recording_is_idempotent_per_version() {
        let pool = memory_pool().await;
        let source_id = Uuid::new_v4();
        let failure = NormalizationFailure::new(
            FailureReason::UnparseableDate,
            Some("date"),
            "no such calendar date",
        );

        record(&pool, source_id, 3, 1, &failure).await.unwrap();
        record(&pool, source_id, 3, 1, &failure).await.unwrap();
        assert_eq!(count_for_source_version(&pool, source_id, 1).await.unwrap(), 1);

        // A different version is a distinct outcome
        record(&pool, source_id, 3, 2, &failure).await.unwrap();
        assert_eq!(count_for_source_version(&pool, source_id, 2).await.unwrap(), 1);

        let failures = for_source_version(&pool, source_id, 1).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].ordinal, 3);
        assert_eq!(failures[0].reason, FailureReason::UnparseableDate);
        assert_eq!(failures[0].field.as_deref(), Some("date"));
    }
}
