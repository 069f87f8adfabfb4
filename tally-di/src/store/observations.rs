//! Observation store operations
//!
//! Append-only: rows are written once per document in a single transaction
//! and never updated. Reads are keyset-paginated on (source_id, ordinal) so
//! any consumer can restart from a cursor without re-reading.

use crate::models::{Observation, ObservationKey, SourceSelector, SourceType};
use crate::store::{StoreError, StoreResult};
use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Receipt for a committed append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReceipt {
    pub source_id: Uuid,
    pub appended: usize,
}

/// Append all observations of one document, all-or-nothing.
///
/// The whole batch commits in one transaction: a duplicate identity or an
/// I/O failure anywhere rolls back everything, leaving the store unchanged
/// for that document. Field content is not validated; any string is
/// accepted verbatim.
pub async fn append(pool: &SqlitePool, observations: &[Observation]) -> StoreResult<AppendReceipt> {
    let first = observations
        .first()
        .ok_or_else(|| StoreError::InvalidAppend("empty observation batch".to_string()))?;
    let source_id = first.source_id;

    if observations.iter().any(|obs| obs.source_id != source_id) {
        return Err(StoreError::InvalidAppend(
            "append batch spans multiple source documents".to_string(),
        ));
    }

    let mut tx = pool.begin().await?;

    for obs in observations {
        let fields_json = serde_json::to_string(&obs.fields)
            .map_err(|e| StoreError::InvalidAppend(format!("unserializable fields: {}", e)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO observations (
                source_id, ordinal, source_type, fields, parser_id, extracted_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(obs.source_id.to_string())
        .bind(obs.ordinal)
        .bind(obs.source_type.as_str())
        .bind(&fields_json)
        .bind(&obs.parser_id)
        .bind(obs.extracted_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        if let Err(err) = result {
            // Transaction rolls back on drop; nothing from this document
            // reaches the store.
            let is_duplicate = err
                .as_database_error()
                .map(|db_err| db_err.is_unique_violation())
                .unwrap_or(false);

            return Err(if is_duplicate {
                StoreError::DuplicateObservation {
                    source_id: obs.source_id,
                    ordinal: obs.ordinal,
                }
            } else {
                StoreError::Storage(err)
            });
        }
    }

    tx.commit().await?;

    tracing::debug!(
        source_id = %source_id,
        count = observations.len(),
        "Observations appended"
    );

    Ok(AppendReceipt {
        source_id,
        appended: observations.len(),
    })
}

/// Fetch one page of observations after the cursor, in (source_id, ordinal)
/// order, restricted by the selector.
pub async fn fetch_page(
    pool: &SqlitePool,
    selector: &SourceSelector,
    after: Option<ObservationKey>,
    limit: i64,
) -> StoreResult<Vec<Observation>> {
    let (cursor_source, cursor_ordinal) = match after {
        Some(key) => (key.source_id.to_string(), key.ordinal),
        // Lexicographically before every UUID
        None => (String::new(), i64::MIN),
    };

    let (filter_sql, filter_value) = match selector {
        SourceSelector::All => ("", String::new()),
        SourceSelector::SourceType(st) => ("AND source_type = ?", st.as_str().to_string()),
        SourceSelector::Source(id) => ("AND source_id = ?", id.to_string()),
    };

    let sql = format!(
        r#"
        SELECT source_id, ordinal, source_type, fields, parser_id, extracted_at
        FROM observations
        WHERE (source_id > ? OR (source_id = ? AND ordinal > ?)) {}
        ORDER BY source_id, ordinal
        LIMIT ?
        "#,
        filter_sql
    );

    let mut query = sqlx::query(&sql)
        .bind(&cursor_source)
        .bind(&cursor_source)
        .bind(cursor_ordinal);
    if !filter_value.is_empty() {
        query = query.bind(filter_value);
    }
    let rows = query.bind(limit).fetch_all(pool).await?;

    rows.iter().map(observation_from_row).collect()
}

/// Lazily stream every observation of one document in ordinal order.
///
/// Finite and restartable: the stream is backed by keyset pagination, so
/// dropping it and building a new one re-reads nothing that was already
/// consumed if the caller tracks its own cursor.
pub fn stream_for_source(
    pool: SqlitePool,
    source_id: Uuid,
    page_size: i64,
) -> impl Stream<Item = StoreResult<Observation>> {
    try_stream! {
        let selector = SourceSelector::Source(source_id);
        let mut cursor: Option<ObservationKey> = None;

        loop {
            let page = fetch_page(&pool, &selector, cursor, page_size).await?;
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(Observation::key);
            for obs in page {
                yield obs;
            }
        }
    }
}

/// Count observations of one document.
pub async fn count_for_source(pool: &SqlitePool, source_id: Uuid) -> StoreResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM observations WHERE source_id = ?")
        .bind(source_id.to_string())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Fetch one observation by identity.
pub async fn get(pool: &SqlitePool, key: ObservationKey) -> StoreResult<Option<Observation>> {
    let row = sqlx::query(
        r#"
        SELECT source_id, ordinal, source_type, fields, parser_id, extracted_at
        FROM observations
        WHERE source_id = ? AND ordinal = ?
        "#,
    )
    .bind(key.source_id.to_string())
    .bind(key.ordinal)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(observation_from_row).transpose()
}

/// Distinct source documents matched by a selector, ordered for stable
/// sweep planning.
pub async fn distinct_sources(
    pool: &SqlitePool,
    selector: &SourceSelector,
) -> StoreResult<Vec<Uuid>> {
    let rows = match selector {
        SourceSelector::All => {
            sqlx::query("SELECT DISTINCT source_id FROM observations ORDER BY source_id")
                .fetch_all(pool)
                .await?
        }
        SourceSelector::SourceType(st) => sqlx::query(
            "SELECT DISTINCT source_id FROM observations WHERE source_type = ? ORDER BY source_id",
        )
        .bind(st.as_str())
        .fetch_all(pool)
        .await?,
        SourceSelector::Source(id) => sqlx::query(
            "SELECT DISTINCT source_id FROM observations WHERE source_id = ? ORDER BY source_id",
        )
        .bind(id.to_string())
        .fetch_all(pool)
        .await?,
    };

    rows.iter()
        .map(|row| parse_uuid(row.get::<String, _>("source_id").as_str()))
        .collect()
}

/// Explicit time-boxed archival: delete observations extracted before the
/// cutoff. This is the only path that ever removes observation rows; it is
/// invoked deliberately, never as a side effect of pipeline work.
pub async fn archive_before(pool: &SqlitePool, cutoff: DateTime<Utc>) -> StoreResult<u64> {
    let result = sqlx::query("DELETE FROM observations WHERE extracted_at < ?")
        .bind(cutoff.to_rfc3339())
        .execute(pool)
        .await?;

    let purged = result.rows_affected();
    if purged > 0 {
        tracing::info!(purged, cutoff = %cutoff, "Archived expired observations");
    }
    Ok(purged)
}

fn observation_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Observation> {
    let source_id = parse_uuid(row.get::<String, _>("source_id").as_str())?;

    let source_type_raw: String = row.get("source_type");
    let source_type = SourceType::parse(&source_type_raw).ok_or_else(|| {
        StoreError::Storage(sqlx::Error::Decode(
            format!("unknown source type {:?}", source_type_raw).into(),
        ))
    })?;

    let fields_json: String = row.get("fields");
    let fields: BTreeMap<String, String> = serde_json::from_str(&fields_json).map_err(|e| {
        StoreError::Storage(sqlx::Error::Decode(
            format!("undecodable observation fields: {}", e).into(),
        ))
    })?;

    let extracted_at_raw: String = row.get("extracted_at");
    let extracted_at = DateTime::parse_from_rfc3339(&extracted_at_raw)
        .map_err(|e| {
            StoreError::Storage(sqlx::Error::Decode(
                format!("undecodable extracted_at: {}", e).into(),
            ))
        })?
        .with_timezone(&Utc);

    Ok(Observation {
        source_id,
        ordinal: row.get("ordinal"),
        source_type,
        fields,
        parser_id: row.get("parser_id"),
        extracted_at,
    })
}

fn parse_uuid(value: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| {
        StoreError::Storage(sqlx::Error::Decode(format!("undecodable uuid: {}", e).into()))
    })
}
