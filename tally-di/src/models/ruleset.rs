//! Versioned normalization rule-sets
//!
//! A rule-set is an immutable bundle of interpretation conventions tagged
//! with a monotonically increasing version number. Once a version has been
//! used to produce a canonical record its behavior never changes, which is
//! what keeps re-normalization reproducible. The normalizer receives the
//! rule-set as an explicit argument and consults nothing else.

use crate::models::observation::SourceType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Order of calendar components in a textual date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateOrder {
    /// 01/02/2024 reads as January 2nd
    MonthDayYear,
    /// 01/02/2024 reads as February 1st
    DayMonthYear,
    /// 2024-01-02
    YearMonthDay,
}

/// How raw amount strings are interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountPolicy {
    /// Character separating whole and fractional parts
    pub decimal_separator: char,

    /// Optional digit-grouping character; grouping characters in the input
    /// are rejected when this is None
    pub thousands_separator: Option<char>,

    /// Parentheses around the value mean negative
    pub parens_negative: bool,

    /// Fixed-point scale of the resulting amount (2 = cents)
    pub scale: u8,
}

impl Default for AmountPolicy {
    fn default() -> Self {
        Self {
            decimal_separator: '.',
            thousands_separator: Some(','),
            parens_negative: true,
            scale: 2,
        }
    }
}

/// Which observation fields carry the transaction data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldNames {
    pub date: String,
    pub amount: String,
    pub description: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            date: "date".to_string(),
            amount: "amount".to_string(),
            description: "description".to_string(),
        }
    }
}

/// Complete interpretation conventions for one class of source documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conventions {
    pub date_order: DateOrder,
    pub amount: AmountPolicy,
    #[serde(default)]
    pub fields: FieldNames,
}

impl Conventions {
    /// US statement defaults: MM/DD/YYYY, dot decimal, comma grouping,
    /// parentheses negative.
    pub fn us() -> Self {
        Self {
            date_order: DateOrder::MonthDayYear,
            amount: AmountPolicy::default(),
            fields: FieldNames::default(),
        }
    }

    /// European statement defaults: DD/MM/YYYY, comma decimal, dot grouping.
    pub fn eu() -> Self {
        Self {
            date_order: DateOrder::DayMonthYear,
            amount: AmountPolicy {
                decimal_separator: ',',
                thousands_separator: Some('.'),
                parens_negative: true,
                scale: 2,
            },
            fields: FieldNames::default(),
        }
    }
}

/// A versioned, immutable bundle of interpretation rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationRuleSet {
    /// Monotonically increasing version number; totally ordered
    pub version: i64,

    /// Conventions used when no source-type override applies
    pub default_conventions: Conventions,

    /// Per-source-type overrides. Keys are the closed SourceType set.
    #[serde(default)]
    pub overrides: BTreeMap<SourceType, Conventions>,
}

impl NormalizationRuleSet {
    /// Resolve conventions for a source type.
    ///
    /// Locale inference lives here and only here: the normalizer asks this
    /// method, never any ambient configuration.
    pub fn resolve(&self, source_type: SourceType) -> &Conventions {
        self.overrides
            .get(&source_type)
            .unwrap_or(&self.default_conventions)
    }
}
