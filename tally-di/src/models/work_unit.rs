//! Unit-of-work state machine
//!
//! Every document moves through the pipeline as a WorkUnit with a guarded
//! state machine: Pending, Extracting, Extracted, Normalizing, Completed,
//! with a failure branch from either working stage and a manual retry edge
//! back to Pending. Extracted is the durable checkpoint: normalization can
//! resume there after a crash without re-invoking the parser.
//!
//! Re-normalization instances are seeded directly at Extracted and never
//! pass through Pending or Extracting.

use crate::models::canonical::FailureReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Workflow state of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkState {
    /// Registered, nothing durable yet
    Pending,
    /// Parser running; nothing committed until append succeeds
    Extracting,
    /// Observations durably appended; safe resume point
    Extracted,
    /// Normalizer walking the observations
    Normalizing,
    /// Every observation has a recorded outcome
    Completed,
    /// Fatal error; waits for manual retry
    Failed,
}

impl WorkState {
    /// Allowed edges of the state machine.
    pub fn can_transition_to(self, next: WorkState) -> bool {
        use WorkState::*;
        matches!(
            (self, next),
            (Pending, Extracting)
                | (Extracting, Extracted)
                | (Extracted, Normalizing)
                | (Normalizing, Completed)
                | (Extracting, Failed)
                | (Normalizing, Failed)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkState::Completed | WorkState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Extracting => "EXTRACTING",
            Self::Extracted => "EXTRACTED",
            Self::Normalizing => "NORMALIZING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "EXTRACTING" => Some(Self::Extracting),
            "EXTRACTED" => Some(Self::Extracted),
            "NORMALIZING" => Some(Self::Normalizing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of run this unit of work is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkKind {
    /// First-time ingest: parse, append, normalize
    Ingest,
    /// Replay of existing observations under a specific rule-set version
    Renormalize { ruleset_version: i64 },
}

/// State machine violations and related work errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: WorkState, to: WorkState },

    #[error("retry is only valid from FAILED, found {0}")]
    NotRetryable(WorkState),
}

/// State transition record, for logging and events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub work_id: Uuid,
    pub old_state: WorkState,
    pub new_state: WorkState,
    pub transitioned_at: DateTime<Utc>,
}

/// One per-record failure inside a completion report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub ordinal: i64,
    pub reason: FailureReason,
    pub field: Option<String>,
    pub detail: String,
}

/// Outcome tallies for one unit of work.
///
/// A batch where some records fail is still a valid terminal state; the
/// failures are enumerated here instead of aborting the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    /// Observations covered by this unit of work
    pub observations: usize,
    /// Records newly written as current
    pub upserted: usize,
    /// Idempotent no-op upserts
    pub unchanged: usize,
    /// Records that replaced a prior version
    pub superseded: usize,
    /// Records stored as historical because a newer version already won
    pub stale: usize,
    /// Per-record failures with reason codes
    pub failures: Vec<RecordFailure>,
}

impl CompletionReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn succeeded(&self) -> usize {
        self.upserted + self.unchanged + self.superseded + self.stale
    }
}

/// One document (or replay of one document) tracked through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub work_id: Uuid,
    pub kind: WorkKind,
    pub source_id: Uuid,
    pub state: WorkState,

    /// Rule-set version pinned when normalization starts, so a resumed run
    /// normalizes with the same rules it began with
    pub ruleset_version: Option<i64>,

    /// Manual retry counter
    pub attempts: u32,

    pub report: CompletionReport,

    /// Terminal error description when state is Failed
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkUnit {
    /// New ingest unit, starting at Pending.
    pub fn ingest(source_id: Uuid) -> Self {
        Self {
            work_id: Uuid::new_v4(),
            kind: WorkKind::Ingest,
            source_id,
            state: WorkState::Pending,
            ruleset_version: None,
            attempts: 0,
            report: CompletionReport::default(),
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// New re-normalization unit, seeded directly at Extracted.
    ///
    /// Observations already exist, so Pending and Extracting are skipped by
    /// construction rather than by transition.
    pub fn renormalization(source_id: Uuid, ruleset_version: i64) -> Self {
        Self {
            work_id: Uuid::new_v4(),
            kind: WorkKind::Renormalize { ruleset_version },
            source_id,
            state: WorkState::Extracted,
            ruleset_version: Some(ruleset_version),
            attempts: 0,
            report: CompletionReport::default(),
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Guarded transition. Strictly ordered: skipping a stage is an error,
    /// not a shortcut.
    pub fn transition_to(&mut self, new_state: WorkState) -> Result<StateTransition, WorkError> {
        if !self.state.can_transition_to(new_state) {
            return Err(WorkError::InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }

        let transition = StateTransition {
            work_id: self.work_id,
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        self.state = new_state;

        if new_state.is_terminal() {
            self.ended_at = Some(Utc::now());
        } else {
            self.ended_at = None;
        }

        Ok(transition)
    }

    /// Manual retry: Failed back to Pending, counting the attempt.
    pub fn retry(&mut self) -> Result<StateTransition, WorkError> {
        if self.state != WorkState::Failed {
            return Err(WorkError::NotRetryable(self.state));
        }
        self.attempts += 1;
        self.error = None;
        self.transition_to(WorkState::Pending)
    }

    /// Mark the unit failed with a terminal error description.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<StateTransition, WorkError> {
        self.error = Some(error.into());
        self.transition_to(WorkState::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_in_order() {
        let mut work = WorkUnit::ingest(Uuid::new_v4());
        assert_eq!(work.state, WorkState::Pending);

        work.transition_to(WorkState::Extracting).unwrap();
        work.transition_to(WorkState::Extracted).unwrap();
        work.transition_to(WorkState::Normalizing).unwrap();
        work.transition_to(WorkState::Completed).unwrap();

        assert!(work.is_terminal());
        assert!(work.ended_at.is_some());
    }

    #[test]
    fn skipping_a_stage_is_rejected() {
        let mut work = WorkUnit::ingest(Uuid::new_v4());
        let err = work.transition_to(WorkState::Normalizing).unwrap_err();
        assert_eq!(
            err,
            WorkError::InvalidTransition {
                from: WorkState::Pending,
                to: WorkState::Normalizing,
            }
        );
        // State unchanged after a rejected transition
        assert_eq!(work.state, WorkState::Pending);
    }

    #[test]
    fn completed_does_not_regress() {
        let mut work = WorkUnit::ingest(Uuid::new_v4());
        work.transition_to(WorkState::Extracting).unwrap();
        work.transition_to(WorkState::Extracted).unwrap();
        work.transition_to(WorkState::Normalizing).unwrap();
        work.transition_to(WorkState::Completed).unwrap();

        assert!(work.transition_to(WorkState::Pending).is_err());
        assert!(work.transition_to(WorkState::Normalizing).is_err());
    }

    #[test]
    fn failure_branch_and_manual_retry() {
        let mut work = WorkUnit::ingest(Uuid::new_v4());
        work.transition_to(WorkState::Extracting).unwrap();
        work.fail("document corrupt").unwrap();
        assert_eq!(work.state, WorkState::Failed);
        assert!(work.error.is_some());

        work.retry().unwrap();
        assert_eq!(work.state, WorkState::Pending);
        assert_eq!(work.attempts, 1);
        assert!(work.error.is_none());
    }

    #[test]
    fn retry_from_non_failed_is_rejected() {
        let mut work = WorkUnit::ingest(Uuid::new_v4());
        assert_eq!(
            work.retry().unwrap_err(),
            WorkError::NotRetryable(WorkState::Pending)
        );
    }

    #[test]
    fn renormalization_is_seeded_at_extracted() {
        let mut work = WorkUnit::renormalization(Uuid::new_v4(), 2);
        assert_eq!(work.state, WorkState::Extracted);
        assert_eq!(work.ruleset_version, Some(2));
        // Can move straight into normalization but never back to extraction
        work.transition_to(WorkState::Normalizing).unwrap();
        assert!(work.transition_to(WorkState::Extracting).is_err());
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            WorkState::Pending,
            WorkState::Extracting,
            WorkState::Extracted,
            WorkState::Normalizing,
            WorkState::Completed,
            WorkState::Failed,
        ] {
            assert_eq!(WorkState::parse(state.as_str()), Some(state));
        }
    }
}
