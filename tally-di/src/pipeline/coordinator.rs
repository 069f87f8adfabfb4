//! Ingest coordinator
//!
//! Drives one document through extraction and normalization as an explicit
//! state machine. The durable checkpoint is Extracted: once observations
//! are committed, a crash or cancellation never sends the document back
//! through the parser. Normalization is resumable because every record
//! outcome is idempotent.

use crate::models::{CompletionReport, WorkKind, WorkState, WorkUnit};
use crate::normalize::Normalizer;
use crate::parse::{self, ParseError, RawDocument};
use crate::store::canonical::UpsertPolicy;
use crate::store::{self, StoreError};
use crate::utils::retry_on_lock;
use anyhow::Result;
use sqlx::SqlitePool;
use tally_common::events::{EventBus, PipelineEvent};
use tokio_util::sync::CancellationToken;

/// Orchestrates ingest units of work against the stores.
pub struct Coordinator {
    db: SqlitePool,
    event_bus: EventBus,
    normalizer: Normalizer,
}

impl Coordinator {
    pub fn new(db: SqlitePool, event_bus: EventBus) -> Self {
        Self {
            db,
            event_bus,
            normalizer: Normalizer::new(),
        }
    }

    /// Execute a complete ingest workflow for a pending unit of work.
    ///
    /// Returns the unit in its resulting state. Fatal conditions (corrupt
    /// document, duplicate extraction, missing rule-set) land in Failed;
    /// they are reported on the unit, not as an Err. Err is reserved for
    /// bookkeeping failures where even the work row could not be saved.
    pub async fn run_ingest(
        &self,
        mut work: WorkUnit,
        document: RawDocument,
        cancel_token: CancellationToken,
    ) -> Result<WorkUnit> {
        if work.state != WorkState::Pending {
            anyhow::bail!(
                "ingest requires a PENDING unit of work, found {}",
                work.state
            );
        }

        tracing::info!(
            work_id = %work.work_id,
            source_id = %work.source_id,
            source_type = %document.source_type,
            "Starting ingest workflow"
        );

        if !self.extract(&mut work, &document).await? {
            return Ok(work);
        }

        self.normalize_phase(&mut work, cancel_token).await?;
        Ok(work)
    }

    /// Resume a unit of work from its durable checkpoint after a restart.
    ///
    /// Valid for units in Extracted or Normalizing. The parser is not
    /// re-invoked; observations are re-read from the store and
    /// already-recorded outcomes no-op.
    pub async fn resume(
        &self,
        mut work: WorkUnit,
        cancel_token: CancellationToken,
    ) -> Result<WorkUnit> {
        match work.state {
            WorkState::Extracted | WorkState::Normalizing => {
                tracing::info!(
                    work_id = %work.work_id,
                    source_id = %work.source_id,
                    state = %work.state,
                    "Resuming unit of work from durable checkpoint"
                );
                self.normalize_phase(&mut work, cancel_token).await?;
                Ok(work)
            }
            other => anyhow::bail!("cannot resume a unit of work in state {}", other),
        }
    }

    /// Re-run a failed unit of work.
    ///
    /// If its observations are already durable the extraction stage passes
    /// through without touching the parser; otherwise the original
    /// document must be resubmitted.
    pub async fn run_retry(
        &self,
        mut work: WorkUnit,
        document: Option<RawDocument>,
        cancel_token: CancellationToken,
    ) -> Result<WorkUnit> {
        let already_extracted =
            store::observations::count_for_source(&self.db, work.source_id).await? > 0;

        if !already_extracted && document.is_none() {
            // Leave the unit in Failed; nothing durable exists to retry
            anyhow::bail!(
                "unit of work {} has no durable observations; resubmit the document",
                work.work_id
            );
        }

        let transition = work.retry()?;
        store::works::save_work(&self.db, &work).await?;
        self.emit_transition(&work, &transition);

        if already_extracted {
            // Extraction is durable from the earlier attempt; move the
            // machine forward through its stages without re-parsing.
            self.apply(&mut work, WorkState::Extracting).await?;
            self.apply(&mut work, WorkState::Extracted).await?;
            self.normalize_phase(&mut work, cancel_token).await?;
            Ok(work)
        } else {
            let document = document.expect("checked above");
            self.run_ingest(work, document, cancel_token).await
        }
    }

    /// Extraction stage: parse and append, all-or-nothing.
    ///
    /// Returns false when the unit terminated in Failed.
    async fn extract(&self, work: &mut WorkUnit, document: &RawDocument) -> Result<bool> {
        self.apply(work, WorkState::Extracting).await?;

        let parser = match parse::parser_for(document.source_type) {
            Some(parser) => parser,
            None => {
                tracing::error!(
                    work_id = %work.work_id,
                    source_type = %document.source_type,
                    "No parser registered for source type"
                );
                return self
                    .fail_work(
                        work,
                        format!("no parser registered for {}", document.source_type),
                    )
                    .await;
            }
        };

        let output = match parser.parse(document) {
            Ok(output) => output,
            Err(ParseError::Corrupt(detail)) => {
                // Fatal: corrupt documents are not retryable
                tracing::error!(
                    work_id = %work.work_id,
                    source_id = %work.source_id,
                    detail = %detail,
                    "Document corrupt, failing without retry"
                );
                return self.fail_work(work, format!("document corrupt: {}", detail)).await;
            }
        };

        for warning in &output.warnings {
            tracing::warn!(
                work_id = %work.work_id,
                source_id = %work.source_id,
                line = warning.line,
                "Parser warning: {}",
                warning.message
            );
        }

        if !output.observations.is_empty() {
            let max_wait_ms = store::settings::max_lock_wait_ms(&self.db).await;
            let append_result = retry_on_lock("observation_append", max_wait_ms, || {
                store::observations::append(&self.db, &output.observations)
            })
            .await;

            match append_result {
                Ok(receipt) => {
                    self.event_bus.emit(PipelineEvent::ObservationsAppended {
                        work_id: work.work_id,
                        source_id: work.source_id,
                        count: receipt.appended,
                        timestamp: chrono::Utc::now(),
                    });
                }
                Err(StoreError::DuplicateObservation { source_id, ordinal }) => {
                    return self
                        .fail_work(
                            work,
                            format!(
                                "observation ({}, {}) already extracted; supersede explicitly",
                                source_id, ordinal
                            ),
                        )
                        .await;
                }
                Err(err) => {
                    // Storage failure after bounded retry
                    return self.fail_work(work, format!("append failed: {}", err)).await;
                }
            }
        }

        // Durable checkpoint
        self.apply(work, WorkState::Extracted).await?;
        Ok(true)
    }

    /// Normalization stage, shared by first runs, resumes, and retries.
    async fn normalize_phase(
        &self,
        work: &mut WorkUnit,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        if work.state == WorkState::Extracted {
            self.apply(work, WorkState::Normalizing).await?;
        }

        let rules = match self.pinned_ruleset(work).await? {
            Some(rules) => rules,
            None => {
                self.fail_work(work, "no rule-set published; publish one and retry")
                    .await?;
                return Ok(());
            }
        };

        if work.ruleset_version.is_none() {
            // Pin the version so a resumed run normalizes with the same
            // rules it began with
            work.ruleset_version = Some(rules.version);
            store::works::save_work(&self.db, work).await?;
        }

        let policy = match work.kind {
            WorkKind::Ingest => UpsertPolicy::Reject,
            WorkKind::Renormalize { .. } => UpsertPolicy::Supersede,
        };

        // The walk always restarts at the first observation. Outcomes that
        // are already durable re-tally as no-ops, so counts persisted by an
        // interrupted run must not carry over or succeeded() would exceed
        // the observation count.
        work.report = CompletionReport::default();

        let page_size = store::settings::observation_page_size(&self.db).await;
        let selector = crate::models::SourceSelector::Source(work.source_id);
        let mut cursor = None;

        loop {
            let page = store::observations::fetch_page(&self.db, &selector, cursor, page_size)
                .await
                .map_err(anyhow::Error::from);

            let page = match page {
                Ok(page) => page,
                Err(err) => {
                    self.fail_work(work, format!("observation read failed: {}", err))
                        .await?;
                    return Ok(());
                }
            };

            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|obs| obs.key());

            for observation in &page {
                // Cancellation checkpoint: between records, never mid-record
                if cancel_token.is_cancelled() {
                    tracing::info!(
                        work_id = %work.work_id,
                        source_id = %work.source_id,
                        "Normalization cancelled; unit stays resumable at NORMALIZING"
                    );
                    store::works::save_work(&self.db, work).await?;
                    return Ok(());
                }

                let processed = super::process_observation(
                    &self.db,
                    &self.normalizer,
                    observation,
                    &rules,
                    policy,
                    &mut work.report,
                )
                .await;

                if let Err(err) = processed {
                    // Storage failure survived bounded retry; without a
                    // durable outcome the unit cannot progress.
                    self.fail_work(work, format!("storage failure: {}", err)).await?;
                    return Ok(());
                }
            }
        }

        super::complete_work(&self.db, &self.event_bus, work, rules.version).await
    }

    /// Rule-set for this unit: the pinned version when resuming, the
    /// latest published version on first entry.
    async fn pinned_ruleset(
        &self,
        work: &WorkUnit,
    ) -> Result<Option<crate::models::NormalizationRuleSet>> {
        match work.ruleset_version {
            Some(version) => {
                let rules = store::rulesets::get(&self.db, version).await?;
                if rules.is_none() {
                    anyhow::bail!("pinned rule-set version {} is not in the registry", version);
                }
                Ok(rules)
            }
            None => Ok(store::rulesets::latest(&self.db).await?),
        }
    }

    /// Guarded transition plus persistence plus event emission.
    async fn apply(&self, work: &mut WorkUnit, state: WorkState) -> Result<()> {
        let transition = work.transition_to(state)?;
        store::works::save_work(&self.db, work).await?;

        tracing::info!(
            work_id = %work.work_id,
            source_id = %work.source_id,
            from = %transition.old_state,
            to = %transition.new_state,
            "Work state transition"
        );

        self.emit_transition(work, &transition);
        Ok(())
    }

    /// Terminal failure path; returns Ok(false) for use in stage methods.
    async fn fail_work(&self, work: &mut WorkUnit, error: impl Into<String>) -> Result<bool> {
        let error = error.into();
        let transition = work.fail(error.as_str())?;
        store::works::save_work(&self.db, work).await?;

        tracing::error!(
            work_id = %work.work_id,
            source_id = %work.source_id,
            error = %error,
            "Unit of work failed"
        );

        self.emit_transition(work, &transition);
        Ok(false)
    }

    fn emit_transition(&self, work: &WorkUnit, transition: &crate::models::StateTransition) {
        self.event_bus.emit(PipelineEvent::WorkStateChanged {
            work_id: work.work_id,
            source_id: work.source_id,
            old_state: transition.old_state.to_string(),
            new_state: transition.new_state.to_string(),
            timestamp: transition.transitioned_at,
        });
    }
}
