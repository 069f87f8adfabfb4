//! Ingest workflow API handlers
//!
//! POST /ingest/documents, GET /ingest/works/:id, POST /ingest/works/:id/cancel,
//! POST /ingest/works/:id/retry

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{CompletionReport, SourceType, WorkState, WorkUnit};
use crate::parse::{self, ParseError, RawDocument};
use crate::pipeline::Coordinator;
use crate::store;
use crate::AppState;
use tokio_util::sync::CancellationToken;

/// POST /ingest/documents request
#[derive(Debug, Deserialize)]
pub struct SubmitDocumentRequest {
    /// Optional caller-assigned document identity; generated when absent
    pub source_id: Option<Uuid>,
    pub source_type: String,
    pub content: String,
}

/// POST /ingest/documents response
#[derive(Debug, Serialize)]
pub struct SubmitDocumentResponse {
    pub work_id: Uuid,
    pub source_id: Uuid,
    pub state: WorkState,
}

/// GET /ingest/works/:id response
#[derive(Debug, Serialize)]
pub struct WorkStatusResponse {
    pub work_id: Uuid,
    pub source_id: Uuid,
    pub state: WorkState,
    pub ruleset_version: Option<i64>,
    pub attempts: u32,
    pub report: CompletionReport,
    pub error: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl WorkStatusResponse {
    fn from_work(work: WorkUnit) -> Self {
        Self {
            work_id: work.work_id,
            source_id: work.source_id,
            state: work.state,
            ruleset_version: work.ruleset_version,
            attempts: work.attempts,
            report: work.report,
            error: work.error,
            started_at: work.started_at,
            ended_at: work.ended_at,
        }
    }
}

/// POST /ingest/documents
///
/// Register a document and start its ingest workflow in the background.
/// Responds immediately with the new unit of work.
pub async fn submit_document(
    State(state): State<AppState>,
    Json(request): Json<SubmitDocumentRequest>,
) -> ApiResult<Json<SubmitDocumentResponse>> {
    let source_type = SourceType::parse(&request.source_type).ok_or_else(|| {
        ApiError::BadRequest(format!("unknown source type {:?}", request.source_type))
    })?;

    if request.content.is_empty() {
        return Err(ApiError::BadRequest("document content is empty".to_string()));
    }

    let source_id = request.source_id.unwrap_or_else(Uuid::new_v4);

    // Reject re-extraction up front; the store would roll it back anyway
    if store::observations::count_for_source(&state.db, source_id).await? > 0 {
        return Err(ApiError::Conflict(format!(
            "document {} is already extracted; re-normalize instead of re-ingesting",
            source_id
        )));
    }

    let document = RawDocument {
        source_id,
        source_type,
        content: request.content,
    };

    // Pre-flight parse: structurally corrupt input is rejected here with
    // 422 instead of burning a unit of work in a background task. The
    // workflow re-parses, which is cheap and deterministic.
    let parser = parse::parser_for(source_type).ok_or_else(|| {
        ApiError::BadRequest(format!("no parser registered for {}", source_type))
    })?;
    if let Err(ParseError::Corrupt(detail)) = parser.parse(&document) {
        return Err(ApiError::Unprocessable(detail));
    }

    let work = WorkUnit::ingest(source_id);
    store::works::save_work(&state.db, &work).await?;

    let response = SubmitDocumentResponse {
        work_id: work.work_id,
        source_id,
        state: work.state,
    };

    tracing::info!(
        work_id = %work.work_id,
        source_id = %source_id,
        source_type = %source_type,
        "Ingest work registered"
    );

    let cancel_token = CancellationToken::new();
    state
        .cancellation_tokens
        .write()
        .await
        .insert(work.work_id, cancel_token.clone());

    // Background workflow task; results land in the work_units table
    let task_state = state.clone();
    let work_id = work.work_id;
    tokio::spawn(async move {
        let coordinator = Coordinator::new(task_state.db.clone(), task_state.event_bus.clone());
        if let Err(e) = coordinator.run_ingest(work, document, cancel_token).await {
            tracing::error!(work_id = %work_id, error = %e, "Ingest workflow task failed");
        }
        task_state.cancellation_tokens.write().await.remove(&work_id);
    });

    Ok(Json(response))
}

/// GET /ingest/works/:id
pub async fn work_status(
    State(state): State<AppState>,
    Path(work_id): Path<Uuid>,
) -> ApiResult<Json<WorkStatusResponse>> {
    let work = store::works::load_work(&state.db, work_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unit of work {}", work_id)))?;

    Ok(Json(WorkStatusResponse::from_work(work)))
}

/// POST /ingest/works/:id/cancel
///
/// Requests cancellation at the next record boundary. The unit stays
/// resumable from its durable checkpoint.
pub async fn cancel_work(
    State(state): State<AppState>,
    Path(work_id): Path<Uuid>,
) -> ApiResult<Json<WorkStatusResponse>> {
    let tokens = state.cancellation_tokens.read().await;
    match tokens.get(&work_id) {
        Some(token) => token.cancel(),
        None => {
            return Err(ApiError::NotFound(format!(
                "no running workflow for unit of work {}",
                work_id
            )))
        }
    }
    drop(tokens);

    let work = store::works::load_work(&state.db, work_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unit of work {}", work_id)))?;

    Ok(Json(WorkStatusResponse::from_work(work)))
}

/// POST /ingest/works/:id/retry
///
/// Manual retry of a failed unit. Durable observations are reused; a unit
/// that failed before extraction committed needs its document resubmitted.
pub async fn retry_work(
    State(state): State<AppState>,
    Path(work_id): Path<Uuid>,
) -> ApiResult<Json<WorkStatusResponse>> {
    let work = store::works::load_work(&state.db, work_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unit of work {}", work_id)))?;

    if work.state != WorkState::Failed {
        return Err(ApiError::Conflict(format!(
            "unit of work {} is {}, only FAILED units can be retried",
            work_id, work.state
        )));
    }

    let cancel_token = CancellationToken::new();
    state
        .cancellation_tokens
        .write()
        .await
        .insert(work_id, cancel_token.clone());

    let task_state = state.clone();
    tokio::spawn(async move {
        let coordinator = Coordinator::new(task_state.db.clone(), task_state.event_bus.clone());
        if let Err(e) = coordinator.run_retry(work, None, cancel_token).await {
            tracing::error!(work_id = %work_id, error = %e, "Retry workflow task failed");
        }
        task_state.cancellation_tokens.write().await.remove(&work_id);
    });

    let refreshed = store::works::load_work(&state.db, work_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unit of work {}", work_id)))?;

    Ok(Json(WorkStatusResponse::from_work(refreshed)))
}

pub fn ingest_routes() -> Router<AppState> {
    Router::new()
        .route("/ingest/documents", post(submit_document))
        .route("/ingest/works/:work_id", get(work_status))
        .route("/ingest/works/:work_id/cancel", post(cancel_work))
        .route("/ingest/works/:work_id/retry", post(retry_work))
}
