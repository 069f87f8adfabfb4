//! Re-normalization sweep API handlers
//!
//! POST /sweeps (consume a "rule-set published, affecting selector" signal),
//! GET /sweeps/:version (progress), POST /sweeps/:version/cancel

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::models::SourceSelector;
use crate::pipeline::{SweepRequest, SweepRunner};
use crate::store;
use crate::store::sweeps::SweepState;
use crate::AppState;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// POST /sweeps request
#[derive(Debug, Deserialize)]
pub struct TriggerSweepRequest {
    pub ruleset_version: i64,
    pub selector: SourceSelector,
}

/// Sweep progress payload
#[derive(Debug, Serialize)]
pub struct SweepStatusResponse {
    pub ruleset_version: i64,
    pub selector: String,
    pub processed: u64,
    pub failed: u64,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct SweepQuery {
    /// Selector storage key, e.g. "all" or "source-type:eu-bank-csv"
    pub selector: Option<String>,
}

/// POST /sweeps
///
/// Enqueue a re-normalization sweep for a published rule-set version and
/// selector. The sweep runs in the background; progress is persisted per
/// record and queryable via GET /sweeps/:version.
pub async fn trigger_sweep(
    State(state): State<AppState>,
    Json(request): Json<TriggerSweepRequest>,
) -> ApiResult<Json<SweepStatusResponse>> {
    // Validate the version before accepting the trigger
    if store::rulesets::get(&state.db, request.ruleset_version)
        .await?
        .is_none()
    {
        return Err(ApiError::NotFound(format!(
            "rule-set version {}",
            request.ruleset_version
        )));
    }

    let sweep_request = SweepRequest {
        ruleset_version: request.ruleset_version,
        selector: request.selector,
    };

    let cancel_token = CancellationToken::new();
    let sweep_token_id = sweep_token_key(request.ruleset_version, &request.selector);
    state
        .cancellation_tokens
        .write()
        .await
        .insert(sweep_token_id, cancel_token.clone());

    tracing::info!(
        ruleset_version = request.ruleset_version,
        selector = %request.selector,
        "Sweep triggered"
    );

    let task_state = state.clone();
    tokio::spawn(async move {
        let runner = SweepRunner::new(task_state.db.clone(), task_state.event_bus.clone());
        if let Err(e) = runner.run(sweep_request, cancel_token).await {
            tracing::error!(
                ruleset_version = sweep_request.ruleset_version,
                error = %e,
                "Sweep task failed"
            );
        }
        task_state
            .cancellation_tokens
            .write()
            .await
            .remove(&sweep_token_id);
    });

    Ok(Json(SweepStatusResponse {
        ruleset_version: request.ruleset_version,
        selector: request.selector.storage_key(),
        processed: 0,
        failed: 0,
        state: SweepState::Running.as_str().to_string(),
    }))
}

/// GET /sweeps/:version?selector=...
pub async fn sweep_status(
    State(state): State<AppState>,
    Path(version): Path<i64>,
    Query(query): Query<SweepQuery>,
) -> ApiResult<Json<SweepStatusResponse>> {
    let selector = parse_selector(query.selector.as_deref())?;

    let progress = store::sweeps::load(&state.db, version, &selector)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "sweep for version {} with selector {}",
                version, selector
            ))
        })?;

    Ok(Json(SweepStatusResponse {
        ruleset_version: progress.ruleset_version,
        selector: progress.selector.storage_key(),
        processed: progress.processed,
        failed: progress.failed,
        state: progress.state.as_str().to_string(),
    }))
}

/// POST /sweeps/:version/cancel?selector=...
pub async fn cancel_sweep(
    State(state): State<AppState>,
    Path(version): Path<i64>,
    Query(query): Query<SweepQuery>,
) -> ApiResult<Json<SweepStatusResponse>> {
    let selector = parse_selector(query.selector.as_deref())?;

    let token_id = sweep_token_key(version, &selector);
    let tokens = state.cancellation_tokens.read().await;
    match tokens.get(&token_id) {
        Some(token) => token.cancel(),
        None => {
            return Err(ApiError::NotFound(format!(
                "no running sweep for version {} with selector {}",
                version, selector
            )))
        }
    }
    drop(tokens);

    let progress = store::sweeps::load(&state.db, version, &selector)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("sweep for version {}", version)))?;

    Ok(Json(SweepStatusResponse {
        ruleset_version: progress.ruleset_version,
        selector: progress.selector.storage_key(),
        processed: progress.processed,
        failed: progress.failed,
        state: progress.state.as_str().to_string(),
    }))
}

fn parse_selector(raw: Option<&str>) -> ApiResult<SourceSelector> {
    match raw {
        None => Ok(SourceSelector::All),
        Some(raw) => SourceSelector::parse(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown selector {:?}", raw))),
    }
}

/// Deterministic token-map key for a (version, selector) sweep.
fn sweep_token_key(version: i64, selector: &SourceSelector) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("sweep:{}:{}", version, selector.storage_key()).as_bytes(),
    )
}

pub fn sweep_routes() -> Router<AppState> {
    Router::new()
        .route("/sweeps", post(trigger_sweep))
        .route("/sweeps/:version", get(sweep_status))
        .route("/sweeps/:version/cancel", post(cancel_sweep))
}
