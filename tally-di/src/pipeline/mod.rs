//! Pipeline orchestration
//!
//! The coordinator drives first-time ingest through the unit-of-work state
//! machine; the sweep runner replays existing observations when a new
//! rule-set version is published. Both share the per-record processing
//! step below, so an observation is handled identically no matter which
//! path reaches it.

pub mod coordinator;
pub mod renormalize;

pub use coordinator::Coordinator;
pub use renormalize::{SweepRunner, SweepRequest};

use crate::models::{
    CanonicalRecord, CompletionReport, FailureReason, NormalizationFailure, NormalizationRuleSet,
    Observation, RecordFailure, WorkState, WorkUnit,
};
use crate::normalize::Normalizer;
use crate::store::canonical::{UpsertOutcome, UpsertPolicy};
use crate::store::{self, StoreError, StoreResult};
use crate::utils::retry_on_lock;
use sqlx::SqlitePool;
use tally_common::events::{EventBus, PipelineEvent};

/// Normalize one observation and make its outcome durable.
///
/// Per-record error isolation: normalization failures and identity
/// conflicts are recorded and tallied, never propagated. Only storage
/// failures (after bounded retry) bubble up, because without durability
/// there is no outcome to record.
pub(crate) async fn process_observation(
    db: &SqlitePool,
    normalizer: &Normalizer,
    observation: &Observation,
    rules: &NormalizationRuleSet,
    policy: UpsertPolicy,
    report: &mut CompletionReport,
) -> StoreResult<()> {
    let max_wait_ms = store::settings::max_lock_wait_ms(db).await;

    match normalizer.normalize(observation, rules) {
        Ok(record) => {
            let result = retry_on_lock("canonical_upsert", max_wait_ms, || {
                store::canonical::upsert(db, &record, policy)
            })
            .await;

            match result {
                Ok(outcome) => {
                    tally_outcome(report, outcome);
                    if matches!(outcome, UpsertOutcome::Inserted | UpsertOutcome::Superseded) {
                        demote_moved_keys(db, &record).await?;
                    }
                }
                Err(StoreError::IdentityConflict { record_key, detail }) => {
                    let failure = NormalizationFailure::new(
                        FailureReason::IdentityConflict,
                        None,
                        format!("key {}: {}", record_key, detail),
                    );
                    record_failure(db, observation, rules.version, &failure, report).await?;
                }
                Err(err) => return Err(err),
            }
        }
        Err(failure) => {
            tracing::debug!(
                source_id = %observation.source_id,
                ordinal = observation.ordinal,
                reason = %failure.reason,
                "Normalization failed for observation"
            );
            record_failure(db, observation, rules.version, &failure, report).await?;
        }
    }

    Ok(())
}

/// Demote stale current entries when re-normalization moved this
/// observation to a new business key. The old entries stay in history.
async fn demote_moved_keys(db: &SqlitePool, record: &CanonicalRecord) -> StoreResult<()> {
    let demoted = store::canonical::supersede_for_observation(
        db,
        record.source_id,
        record.ordinal,
        &record.record_key,
    )
    .await?;

    if demoted > 0 {
        tracing::warn!(
            source_id = %record.source_id,
            ordinal = record.ordinal,
            new_key = %record.record_key,
            ruleset_version = record.ruleset_version,
            demoted,
            "Business key moved under new rule-set version; prior entries kept as history"
        );
    }
    Ok(())
}

async fn record_failure(
    db: &SqlitePool,
    observation: &Observation,
    ruleset_version: i64,
    failure: &NormalizationFailure,
    report: &mut CompletionReport,
) -> StoreResult<()> {
    store::failures::record(
        db,
        observation.source_id,
        observation.ordinal,
        ruleset_version,
        failure,
    )
    .await?;

    report.failures.push(RecordFailure {
        ordinal: observation.ordinal,
        reason: failure.reason,
        field: failure.field.clone(),
        detail: failure.detail.clone(),
    });
    Ok(())
}

fn tally_outcome(report: &mut CompletionReport, outcome: UpsertOutcome) {
    match outcome {
        UpsertOutcome::Inserted => report.upserted += 1,
        UpsertOutcome::Unchanged => report.unchanged += 1,
        UpsertOutcome::Superseded => report.superseded += 1,
        UpsertOutcome::StaleVersion => report.stale += 1,
    }
}

/// Close out a unit of work whose observations have all been visited.
///
/// The completion guard re-derives outcome coverage from the stores: the
/// unit terminates only when every observation of the document has either
/// a canonical record or a recorded failure under the pinned version.
/// Failures found in the store (including ones recorded by earlier,
/// interrupted runs) replace the in-memory tally so the report is whole.
pub(crate) async fn complete_work(
    db: &SqlitePool,
    event_bus: &EventBus,
    work: &mut WorkUnit,
    ruleset_version: i64,
) -> anyhow::Result<()> {
    let total = store::observations::count_for_source(db, work.source_id).await?;
    let outcomes = store::count_outcomes(db, work.source_id, ruleset_version).await?;

    if outcomes < total {
        anyhow::bail!(
            "unit of work {} has {} of {} outcomes recorded; refusing to complete",
            work.work_id,
            outcomes,
            total
        );
    }

    work.report.observations = total as usize;
    work.report.failures =
        store::failures::for_source_version(db, work.source_id, ruleset_version).await?;

    let fail_on_partial = store::settings::fail_on_partial(db).await;
    let transition = if fail_on_partial && !work.report.failures.is_empty() {
        let summary = format!(
            "{} of {} records failed normalization",
            work.report.failed(),
            total
        );
        work.fail(summary)?
    } else {
        work.transition_to(WorkState::Completed)?
    };

    store::works::save_work(db, work).await?;

    tracing::info!(
        work_id = %work.work_id,
        source_id = %work.source_id,
        state = %work.state,
        observations = work.report.observations,
        succeeded = work.report.succeeded(),
        failed = work.report.failed(),
        "Unit of work finished"
    );

    event_bus.emit(PipelineEvent::WorkStateChanged {
        work_id: work.work_id,
        source_id: work.source_id,
        old_state: transition.old_state.to_string(),
        new_state: transition.new_state.to_string(),
        timestamp: transition.transitioned_at,
    });
    event_bus.emit(PipelineEvent::WorkCompleted {
        work_id: work.work_id,
        source_id: work.source_id,
        upserted: work.report.succeeded(),
        failed: work.report.failed(),
        terminal_state: work.state.to_string(),
        timestamp: chrono::Utc::now(),
    });

    Ok(())
}
