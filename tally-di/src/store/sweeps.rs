//! Re-normalization sweep cursors
//!
//! A sweep walks the observation store in (source_id, ordinal) order. Its
//! cursor is persisted after every record, so cancellation or a crash
//! loses at most the record in flight, and a restarted sweep continues
//! where the last one stopped instead of replaying from the beginning.

use crate::models::{ObservationKey, SourceSelector};
use sqlx::{Row, SqlitePool};
use tally_common::{Error, Result};
use uuid::Uuid;

/// Lifecycle of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Running,
    Completed,
    Cancelled,
}

impl SweepState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Persisted progress of one sweep, keyed by (version, selector).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepProgress {
    pub ruleset_version: i64,
    pub selector: SourceSelector,
    /// Last observation whose outcome is durable; None before the first
    pub cursor: Option<ObservationKey>,
    pub processed: u64,
    pub failed: u64,
    pub state: SweepState,
}

impl SweepProgress {
    pub fn new(ruleset_version: i64, selector: SourceSelector) -> Self {
        Self {
            ruleset_version,
            selector,
            cursor: None,
            processed: 0,
            failed: 0,
            state: SweepState::Running,
        }
    }
}

/// Load sweep progress, if the sweep has ever run.
pub async fn load(
    pool: &SqlitePool,
    ruleset_version: i64,
    selector: &SourceSelector,
) -> Result<Option<SweepProgress>> {
    let row = sqlx::query("SELECT * FROM sweeps WHERE ruleset_version = ? AND selector = ?")
        .bind(ruleset_version)
        .bind(selector.storage_key())
        .fetch_optional(pool)
        .await?;

    row.map(|row| {
        let selector_raw: String = row.get("selector");
        let selector = SourceSelector::parse(&selector_raw)
            .ok_or_else(|| Error::Internal(format!("Unknown sweep selector {:?}", selector_raw)))?;

        let state_raw: String = row.get("state");
        let state = SweepState::parse(&state_raw)
            .ok_or_else(|| Error::Internal(format!("Unknown sweep state {:?}", state_raw)))?;

        let cursor_source_id: Option<String> = row.get("cursor_source_id");
        let cursor_ordinal: Option<i64> = row.get("cursor_ordinal");
        let cursor = match (cursor_source_id, cursor_ordinal) {
            (Some(source), Some(ordinal)) => Some(ObservationKey {
                source_id: Uuid::parse_str(&source).map_err(|e| {
                    Error::Internal(format!("Failed to parse cursor source_id: {}", e))
                })?,
                ordinal,
            }),
            _ => None,
        };

        Ok(SweepProgress {
            ruleset_version: row.get("ruleset_version"),
            selector,
            cursor,
            processed: row.get::<i64, _>("processed") as u64,
            failed: row.get::<i64, _>("failed") as u64,
            state,
        })
    })
    .transpose()
}

/// Persist sweep progress, inserting or updating by (version, selector).
pub async fn save(pool: &SqlitePool, progress: &SweepProgress) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sweeps (
            ruleset_version, selector, cursor_source_id, cursor_ordinal,
            processed, failed, state, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(ruleset_version, selector) DO UPDATE SET
            cursor_source_id = excluded.cursor_source_id,
            cursor_ordinal = excluded.cursor_ordinal,
            processed = excluded.processed,
            failed = excluded.failed,
            state = excluded.state,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(progress.ruleset_version)
    .bind(progress.selector.storage_key())
    .bind(progress.cursor.map(|key| key.source_id.to_string()))
    .bind(progress.cursor.map(|key| key.ordinal))
    .bind(progress.processed as i64)
    .bind(progress.failed as i64)
    .bind(progress.state.as_str())
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use crate::store::memory_pool;

    #[tokio::test]
    async fn save_load_round_trip_with_cursor() {
        let pool = memory_pool().await;
        let selector = SourceSelector::SourceType(SourceType::UsBankCsv);

        let mut progress = SweepProgress::new(2, selector);
        assert!(load(&pool, 2, &selector).await.unwrap().is_none());

        progress.cursor = Some(ObservationKey {
            source_id: Uuid::new_v4(),
            ordinal: 41,
        });
        progress.processed = 42;
        progress.failed = 1;
        save(&pool, &progress).await.unwrap();

        let loaded = load(&pool, 2, &selector).await.unwrap().unwrap();
        assert_eq!(loaded, progress);
    }

    #[tokio::test]
    async fn update_overwrites_single_row() {
        let pool = memory_pool().await;
        let selector = SourceSelector::All;

        let mut progress = SweepProgress::new(1, selector);
        save(&pool, &progress).await.unwrap();

        progress.processed = 10;
        progress.state = SweepState::Completed;
        save(&pool, &progress).await.unwrap();

        let loaded = load(&pool, 1, &selector).await.unwrap().unwrap();
        assert_eq!(loaded.processed, 10);
        assert_eq!(loaded.state, SweepState::Completed);
    }

    #[tokio::test]
    async fn sweeps_for_different_versions_are_independent() {
        let pool = memory_pool().await;
        let selector = SourceSelector::All;

        save(&pool, &SweepProgress::new(1, selector)).await.unwrap();
        let mut v2 = SweepProgress::new(2, selector);
        v2.processed = 5;
        save(&pool, &v2).await.unwrap();

        assert_eq!(load(&pool, 1, &selector).await.unwrap().unwrap().processed, 0);
        assert_eq!(load(&pool, 2, &selector).await.unwrap().unwrap().processed, 5);
    }
}
