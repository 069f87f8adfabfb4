//! Rule-set registry API handlers
//!
//! POST /rulesets (publish), GET /rulesets, GET /rulesets/:version

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::models::NormalizationRuleSet;
use crate::store;
use crate::AppState;
use tally_common::events::PipelineEvent;

/// POST /rulesets response
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub version: i64,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

/// GET /rulesets response
#[derive(Debug, Serialize)]
pub struct VersionsResponse {
    pub versions: Vec<i64>,
}

/// POST /rulesets
///
/// Publish a new rule-set version. Versions are totally ordered and
/// immutable once published; republishing or regressing is a 409.
pub async fn publish_ruleset(
    State(state): State<AppState>,
    Json(ruleset): Json<NormalizationRuleSet>,
) -> ApiResult<Json<PublishResponse>> {
    let version = ruleset.version;
    store::rulesets::publish(&state.db, &ruleset).await?;

    let published_at = chrono::Utc::now();
    state.event_bus.emit(PipelineEvent::RuleSetPublished {
        version,
        timestamp: published_at,
    });

    Ok(Json(PublishResponse {
        version,
        published_at,
    }))
}

/// GET /rulesets
pub async fn list_versions(State(state): State<AppState>) -> ApiResult<Json<VersionsResponse>> {
    let versions = store::rulesets::versions(&state.db).await?;
    Ok(Json(VersionsResponse { versions }))
}

/// GET /rulesets/:version
pub async fn get_ruleset(
    State(state): State<AppState>,
    Path(version): Path<i64>,
) -> ApiResult<Json<NormalizationRuleSet>> {
    let ruleset = store::rulesets::get(&state.db, version)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("rule-set version {}", version)))?;
    Ok(Json(ruleset))
}

pub fn ruleset_routes() -> Router<AppState> {
    Router::new()
        .route("/rulesets", post(publish_ruleset).get(list_versions))
        .route("/rulesets/:version", get(get_ruleset))
}
