//! Re-normalization sweeps
//!
//! When a new rule-set version is published, a sweep replays matching
//! observations from the observation store. The parser is never involved.
//! Each source document gets its own unit of work seeded directly at
//! Extracted; the sweep's own progress is a keyset cursor persisted after
//! every record, so cancellation and crashes lose nothing durable and a
//! re-run continues from the cursor.

use crate::models::{SourceSelector, WorkState, WorkUnit};
use crate::normalize::Normalizer;
use crate::store::canonical::UpsertPolicy;
use crate::store::sweeps::{SweepProgress, SweepState};
use crate::store;
use sqlx::SqlitePool;
use tally_common::events::{EventBus, PipelineEvent};
use tally_common::{Error, Result};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Operational trigger: "rule-set vN published, affecting selector S".
#[derive(Debug, Clone, Copy)]
pub struct SweepRequest {
    pub ruleset_version: i64,
    pub selector: SourceSelector,
}

/// Runs re-normalization sweeps to completion, cursor-checkpointed.
pub struct SweepRunner {
    db: SqlitePool,
    event_bus: EventBus,
    normalizer: Normalizer,
}

impl SweepRunner {
    pub fn new(db: SqlitePool, event_bus: EventBus) -> Self {
        Self {
            db,
            event_bus,
            normalizer: Normalizer::new(),
        }
    }

    /// Run (or resume) the sweep described by the request.
    ///
    /// Idempotent: a sweep that already completed returns its final
    /// progress untouched. A cancelled or crashed sweep resumes from its
    /// persisted cursor.
    pub async fn run(
        &self,
        request: SweepRequest,
        cancel_token: CancellationToken,
    ) -> Result<SweepProgress> {
        let rules = store::rulesets::get(&self.db, request.ruleset_version)
            .await?
            .ok_or_else(|| {
                Error::RuleSet(format!(
                    "version {} has not been published",
                    request.ruleset_version
                ))
            })?;

        let mut progress = store::sweeps::load(&self.db, request.ruleset_version, &request.selector)
            .await?
            .unwrap_or_else(|| SweepProgress::new(request.ruleset_version, request.selector));

        if progress.state == SweepState::Completed {
            tracing::info!(
                ruleset_version = request.ruleset_version,
                selector = %request.selector,
                "Sweep already completed, nothing to do"
            );
            return Ok(progress);
        }

        let resuming = progress.cursor.is_some();
        progress.state = SweepState::Running;
        store::sweeps::save(&self.db, &progress).await?;

        tracing::info!(
            ruleset_version = request.ruleset_version,
            selector = %request.selector,
            resuming,
            "Sweep started"
        );
        self.event_bus.emit(PipelineEvent::SweepStarted {
            ruleset_version: request.ruleset_version,
            selector: request.selector.storage_key(),
            timestamp: chrono::Utc::now(),
        });

        let page_size = store::settings::observation_page_size(&self.db).await;
        // Per-document state machine instance currently being filled
        let mut current_work: Option<WorkUnit> = None;

        loop {
            let page = store::observations::fetch_page(
                &self.db,
                &request.selector,
                progress.cursor,
                page_size,
            )
            .await
            .map_err(|e| Error::Internal(format!("observation read failed: {}", e)))?;

            if page.is_empty() {
                break;
            }

            for observation in &page {
                // Cancellation checkpoint sits on the record boundary;
                // the cursor already covers everything durable.
                if cancel_token.is_cancelled() {
                    return self.suspend(progress, current_work).await;
                }

                // Document boundary: close the finished instance, open
                // the next one seeded at Extracted.
                let source_changed = current_work
                    .as_ref()
                    .map(|work| work.source_id != observation.source_id)
                    .unwrap_or(true);
                if source_changed {
                    if let Some(mut work) = current_work.take() {
                        super::complete_work(
                            &self.db,
                            &self.event_bus,
                            &mut work,
                            request.ruleset_version,
                        )
                        .await
                        .map_err(|e| Error::Internal(e.to_string()))?;
                    }
                    current_work = Some(
                        self.open_document_work(observation.source_id, request.ruleset_version)
                            .await?,
                    );
                }
                let work = current_work.as_mut().expect("work opened above");

                let processed = super::process_observation(
                    &self.db,
                    &self.normalizer,
                    observation,
                    &rules,
                    UpsertPolicy::Supersede,
                    &mut work.report,
                )
                .await;

                if let Err(err) = processed {
                    // Storage failure survived bounded retry: leave the
                    // cursor at the last durable record and surface it.
                    store::sweeps::save(&self.db, &progress).await?;
                    return Err(Error::Internal(format!(
                        "sweep storage failure after record ({}, {}): {}",
                        observation.source_id, observation.ordinal, err
                    )));
                }

                progress.processed += 1;
                if work
                    .report
                    .failures
                    .last()
                    .map(|f| f.ordinal == observation.ordinal)
                    .unwrap_or(false)
                {
                    progress.failed += 1;
                }
                progress.cursor = Some(observation.key());
                store::sweeps::save(&self.db, &progress).await?;
            }

            self.event_bus.emit(PipelineEvent::SweepProgress {
                ruleset_version: request.ruleset_version,
                processed: progress.processed,
                failed: progress.failed,
                timestamp: chrono::Utc::now(),
            });
        }

        if let Some(mut work) = current_work.take() {
            super::complete_work(&self.db, &self.event_bus, &mut work, request.ruleset_version)
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
        }

        progress.state = SweepState::Completed;
        store::sweeps::save(&self.db, &progress).await?;

        tracing::info!(
            ruleset_version = request.ruleset_version,
            selector = %request.selector,
            processed = progress.processed,
            failed = progress.failed,
            "Sweep completed"
        );
        self.event_bus.emit(PipelineEvent::SweepFinished {
            ruleset_version: request.ruleset_version,
            processed: progress.processed,
            failed: progress.failed,
            cancelled: false,
            timestamp: chrono::Utc::now(),
        });

        Ok(progress)
    }

    /// Open the per-document state machine instance for a sweep.
    ///
    /// Seeded at Extracted because the observations are already durable;
    /// the instance moves straight into Normalizing.
    async fn open_document_work(&self, source_id: Uuid, ruleset_version: i64) -> Result<WorkUnit> {
        let mut work = WorkUnit::renormalization(source_id, ruleset_version);
        let transition = work
            .transition_to(WorkState::Normalizing)
            .map_err(|e| Error::Internal(e.to_string()))?;
        store::works::save_work(&self.db, &work).await?;

        tracing::debug!(
            work_id = %work.work_id,
            source_id = %source_id,
            ruleset_version,
            "Opened re-normalization work unit"
        );

        self.event_bus.emit(PipelineEvent::WorkStateChanged {
            work_id: work.work_id,
            source_id,
            old_state: transition.old_state.to_string(),
            new_state: transition.new_state.to_string(),
            timestamp: transition.transitioned_at,
        });

        Ok(work)
    }

    /// Cancellation path: persist everything resumable and report.
    async fn suspend(
        &self,
        mut progress: SweepProgress,
        current_work: Option<WorkUnit>,
    ) -> Result<SweepProgress> {
        if let Some(work) = current_work {
            // Left in NORMALIZING; the resumed sweep revisits this
            // document and its outcomes no-op.
            store::works::save_work(&self.db, &work).await?;
        }

        progress.state = SweepState::Cancelled;
        store::sweeps::save(&self.db, &progress).await?;

        tracing::info!(
            ruleset_version = progress.ruleset_version,
            selector = %progress.selector,
            processed = progress.processed,
            "Sweep cancelled between records; cursor retained for resume"
        );
        self.event_bus.emit(PipelineEvent::SweepFinished {
            ruleset_version: progress.ruleset_version,
            processed: progress.processed,
            failed: progress.failed,
            cancelled: true,
            timestamp: chrono::Utc::now(),
        });

        Ok(progress)
    }
}
