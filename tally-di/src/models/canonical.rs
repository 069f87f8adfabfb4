//! Canonical records and normalization failure reporting
//!
//! A canonical record is the validated, typed interpretation of exactly one
//! observation under one rule-set version. Re-running the normalizer on the
//! same observation with the same rule-set version must reproduce the record
//! exactly, so nothing here depends on wall-clock time or ambient state.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Signed fixed-point decimal amount.
///
/// `minor_units` is the value scaled by `10^scale`, so `-50.00` with scale 2
/// is `minor_units = -5000`. Integer representation keeps equality and
/// hashing exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Amount {
    pub minor_units: i64,
    pub scale: u8,
}

impl Amount {
    pub fn new(minor_units: i64, scale: u8) -> Self {
        Self { minor_units, scale }
    }

    pub fn is_negative(&self) -> bool {
        self.minor_units < 0
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.minor_units);
        }
        let divisor = 10i64.pow(self.scale as u32);
        let sign = if self.minor_units < 0 { "-" } else { "" };
        let abs = self.minor_units.unsigned_abs();
        let whole = abs / divisor as u64;
        let frac = abs % divisor as u64;
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            whole,
            frac,
            width = self.scale as usize
        )
    }
}

/// A validated record derived from exactly one observation via a specific
/// rule-set version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// Business identity key derived from the normalized fields
    pub record_key: String,

    /// Calendar date of the transaction
    pub posted_on: NaiveDate,

    /// Signed fixed-point amount
    pub amount: Amount,

    /// Cleaned description text
    pub description: String,

    /// Originating observation: source document identity
    pub source_id: Uuid,

    /// Originating observation: ordinal position
    pub ordinal: i64,

    /// Rule-set version that produced this record
    pub ruleset_version: i64,
}

impl CanonicalRecord {
    /// Derive the business identity key from normalized field values.
    ///
    /// SHA-256 over a stable serialization of date, amount, and description.
    /// Two records with the same normalized content share a key, which is
    /// what makes the canonical upsert idempotent.
    pub fn derive_key(posted_on: NaiveDate, amount: Amount, description: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(posted_on.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(amount.minor_units.to_le_bytes());
        hasher.update([amount.scale]);
        hasher.update(b"|");
        hasher.update(description.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Why one observation could not be normalized.
///
/// Per-record outcome: recorded in the completion report, never fatal to
/// the rest of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    UnparseableDate,
    UnparseableAmount,
    AmbiguousAmountSign,
    MissingField,
    IdentityConflict,
}

impl FailureReason {
    /// Stable reason code used in reports and persistence.
    pub fn code(self) -> &'static str {
        match self {
            Self::UnparseableDate => "unparseable-date",
            Self::UnparseableAmount => "unparseable-amount",
            Self::AmbiguousAmountSign => "ambiguous-amount-sign",
            Self::MissingField => "missing-field",
            Self::IdentityConflict => "identity-conflict",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "unparseable-date" => Some(Self::UnparseableDate),
            "unparseable-amount" => Some(Self::UnparseableAmount),
            "ambiguous-amount-sign" => Some(Self::AmbiguousAmountSign),
            "missing-field" => Some(Self::MissingField),
            "identity-conflict" => Some(Self::IdentityConflict),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A recorded normalization failure for one observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationFailure {
    pub reason: FailureReason,
    /// Field the failure applies to, when attributable to one
    pub field: Option<String>,
    pub detail: String,
}

impl NormalizationFailure {
    pub fn new(reason: FailureReason, field: Option<&str>, detail: impl Into<String>) -> Self {
        Self {
            reason,
            field: field.map(str::to_string),
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for NormalizationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{} ({}): {}", self.reason, field, self.detail),
            None => write!(f, "{}: {}", self.reason, self.detail),
        }
    }
}
