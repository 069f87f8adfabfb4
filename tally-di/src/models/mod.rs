//! Data model for the document-ingest pipeline

pub mod canonical;
pub mod observation;
pub mod ruleset;
pub mod work_unit;

pub use canonical::{Amount, CanonicalRecord, FailureReason, NormalizationFailure};
pub use observation::{Observation, ObservationKey, SourceSelector, SourceType};
pub use ruleset::{AmountPolicy, Conventions, DateOrder, FieldNames, NormalizationRuleSet};
pub use work_unit::{
    CompletionReport, RecordFailure, StateTransition, WorkError, WorkKind, WorkState, WorkUnit,
};
