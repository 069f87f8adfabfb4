//! Observation archival API handler
//!
//! POST /observations/archive — the explicit, time-boxed archival
//! operation. Observations are never deleted as a side effect of pipeline
//! work; this endpoint is the one deliberate path, bounded by the
//! configured retention window.

use axum::{extract::State, routing::post, Json, Router};
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::store;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ArchiveResponse {
    pub retention_days: i64,
    pub cutoff: chrono::DateTime<chrono::Utc>,
    pub purged: u64,
}

/// POST /observations/archive
///
/// Purges observations older than the configured retention window.
/// Rejected when no window is configured: keep-forever is the default and
/// must be overridden deliberately.
pub async fn archive_expired(State(state): State<AppState>) -> ApiResult<Json<ArchiveResponse>> {
    let retention_days = store::settings::retention_days(&state.db)
        .await
        .ok_or_else(|| {
            ApiError::BadRequest(format!(
                "no retention window configured; set {} first",
                store::settings::KEY_RETENTION_DAYS
            ))
        })?;

    let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
    let purged = store::observations::archive_before(&state.db, cutoff).await?;

    tracing::info!(retention_days, cutoff = %cutoff, purged, "Archival pass finished");

    Ok(Json(ArchiveResponse {
        retention_days,
        cutoff,
        purged,
    }))
}

pub fn observation_routes() -> Router<AppState> {
    Router::new().route("/observations/archive", post(archive_expired))
}
