//! Unit-of-work persistence
//!
//! Work units survive crashes: state, tallies, and the pinned rule-set
//! version are written after every transition so the coordinator can
//! resume from the last durable checkpoint.

use crate::models::{CompletionReport, WorkKind, WorkState, WorkUnit};
use crate::utils::retry_on_lock;
use sqlx::{Row, SqlitePool};
use tally_common::{Error, Result};
use uuid::Uuid;

/// Save a work unit, inserting or updating by work_id.
///
/// Uses retry_on_lock to ride out transient database lock contention.
pub async fn save_work(pool: &SqlitePool, work: &WorkUnit) -> Result<()> {
    // Prepare all data before touching the database
    let work_id = work.work_id.to_string();
    let kind = match work.kind {
        WorkKind::Ingest => "ingest",
        WorkKind::Renormalize { .. } => "renormalize",
    };
    let source_id = work.source_id.to_string();
    let state = work.state.as_str();
    let report = serde_json::to_string(&work.report)
        .map_err(|e| Error::Internal(format!("Failed to serialize report: {}", e)))?;
    let started_at = work.started_at.to_rfc3339();
    let ended_at = work.ended_at.map(|dt| dt.to_rfc3339());

    let max_wait_ms = crate::store::settings::max_lock_wait_ms(pool).await;

    retry_on_lock("save_work", max_wait_ms, || async {
        sqlx::query(
            r#"
            INSERT INTO work_units (
                work_id, kind, source_id, state, ruleset_version,
                attempts, report, error, started_at, ended_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(work_id) DO UPDATE SET
                state = excluded.state,
                ruleset_version = excluded.ruleset_version,
                attempts = excluded.attempts,
                report = excluded.report,
                error = excluded.error,
                ended_at = excluded.ended_at
            "#,
        )
        .bind(&work_id)
        .bind(kind)
        .bind(&source_id)
        .bind(state)
        .bind(work.ruleset_version)
        .bind(work.attempts as i64)
        .bind(&report)
        .bind(&work.error)
        .bind(&started_at)
        .bind(&ended_at)
        .execute(pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    })
    .await
}

/// Load a work unit by id.
pub async fn load_work(pool: &SqlitePool, work_id: Uuid) -> Result<Option<WorkUnit>> {
    let row = sqlx::query("SELECT * FROM work_units WHERE work_id = ?")
        .bind(work_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(work_from_row).transpose()
}

/// Work units not yet in a terminal state, oldest first.
pub async fn active_works(pool: &SqlitePool) -> Result<Vec<WorkUnit>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM work_units
        WHERE state NOT IN ('COMPLETED', 'FAILED')
        ORDER BY started_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(work_from_row).collect()
}

/// Startup recovery for units interrupted by a crash.
///
/// Units caught in EXTRACTING revert to PENDING: the append is
/// all-or-nothing, so nothing of theirs was committed and the stage can
/// simply run again. Units in EXTRACTED or NORMALIZING are left alone;
/// the coordinator resumes them from the durable checkpoint without
/// re-invoking the parser.
pub async fn revert_interrupted_extractions(pool: &SqlitePool) -> Result<usize> {
    let result = sqlx::query("UPDATE work_units SET state = 'PENDING' WHERE state = 'EXTRACTING'")
        .execute(pool)
        .await?;

    let reverted = result.rows_affected() as usize;
    if reverted > 0 {
        tracing::info!(reverted, "Reverted interrupted extractions to PENDING");
    }
    Ok(reverted)
}

/// Units resumable at the durable checkpoint after a restart.
pub async fn resumable_works(pool: &SqlitePool) -> Result<Vec<WorkUnit>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM work_units
        WHERE state IN ('EXTRACTED', 'NORMALIZING')
        ORDER BY started_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(work_from_row).collect()
}

fn work_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorkUnit> {
    let work_id_raw: String = row.get("work_id");
    let work_id = Uuid::parse_str(&work_id_raw)
        .map_err(|e| Error::Internal(format!("Failed to parse work_id: {}", e)))?;

    let source_id_raw: String = row.get("source_id");
    let source_id = Uuid::parse_str(&source_id_raw)
        .map_err(|e| Error::Internal(format!("Failed to parse source_id: {}", e)))?;

    let state_raw: String = row.get("state");
    let state = WorkState::parse(&state_raw)
        .ok_or_else(|| Error::Internal(format!("Unknown work state {:?}", state_raw)))?;

    let ruleset_version: Option<i64> = row.get("ruleset_version");

    let kind_raw: String = row.get("kind");
    let kind = match kind_raw.as_str() {
        "ingest" => WorkKind::Ingest,
        "renormalize" => WorkKind::Renormalize {
            ruleset_version: ruleset_version.ok_or_else(|| {
                Error::Internal("renormalize work unit has no rule-set version".to_string())
            })?,
        },
        other => return Err(Error::Internal(format!("Unknown work kind {:?}", other))),
    };

    let report_raw: String = row.get("report");
    let report: CompletionReport = serde_json::from_str(&report_raw)
        .map_err(|e| Error::Internal(format!("Failed to deserialize report: {}", e)))?;

    let started_at_raw: String = row.get("started_at");
    let started_at = chrono::DateTime::parse_from_rfc3339(&started_at_raw)
        .map_err(|e| Error::Internal(format!("Failed to parse started_at: {}", e)))?
        .with_timezone(&chrono::Utc);

    let ended_at: Option<String> = row.get("ended_at");
    let ended_at = ended_at
        .map(|s| chrono::DateTime::parse_from_rfc3339(&s))
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to parse ended_at: {}", e)))?
        .map(|dt| dt.with_timezone(&chrono::Utc));

    Ok(WorkUnit {
        work_id,
        kind,
        source_id,
        state,
        ruleset_version,
        attempts: row.get::<i64, _>("attempts") as u32,
        report,
        error: row.get("error"),
        started_at,
        ended_at,
    })
}
