//! Raw observations captured from source documents
//!
//! An observation is the uninterpreted output of extraction: field values
//! exactly as the parser saw them, plus provenance metadata. Field values
//! are never trimmed, transformed, or type-coerced after capture.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Known source document kinds.
///
/// Closed set: each variant maps to an explicit convention-resolution
/// strategy in the rule-set layer. Adding a source kind means adding a
/// variant here and a convention entry there, not a string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    /// US bank statement export, comma-delimited
    UsBankCsv,
    /// European bank statement export, semicolon-delimited
    EuBankCsv,
    /// Text extracted from a PDF statement by an external parser
    PdfStatement,
    /// Generic delimited text with no locale hint
    GenericDelimited,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UsBankCsv => "us-bank-csv",
            Self::EuBankCsv => "eu-bank-csv",
            Self::PdfStatement => "pdf-statement",
            Self::GenericDelimited => "generic-delimited",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "us-bank-csv" => Some(Self::UsBankCsv),
            "eu-bank-csv" => Some(Self::EuBankCsv),
            "pdf-statement" => Some(Self::PdfStatement),
            "generic-delimited" => Some(Self::GenericDelimited),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a single observation: (source document, ordinal position).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservationKey {
    pub source_id: Uuid,
    pub ordinal: i64,
}

/// A raw, uninterpreted field-value record captured verbatim from a source
/// document. Immutable after write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Source document identity
    pub source_id: Uuid,

    /// Position within the source document (0-based)
    pub ordinal: i64,

    /// Format/locale hint recorded at extraction time
    pub source_type: SourceType,

    /// Field name to literal string value, exactly as extracted.
    /// BTreeMap keeps serialization order deterministic.
    pub fields: BTreeMap<String, String>,

    /// Identity and version of the parser that produced this observation
    pub parser_id: String,

    /// Extraction timestamp
    pub extracted_at: DateTime<Utc>,
}

impl Observation {
    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            source_id: self.source_id,
            ordinal: self.ordinal,
        }
    }
}

/// Selects which observations a re-normalization sweep covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum SourceSelector {
    /// Every observation in the store
    All,
    /// All observations from documents of one source type
    SourceType(SourceType),
    /// All observations of a single source document
    Source(Uuid),
}

impl SourceSelector {
    /// Stable string form used as part of the sweep progress key.
    pub fn storage_key(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::SourceType(st) => format!("source-type:{}", st.as_str()),
            Self::Source(id) => format!("source:{}", id),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        if value == "all" {
            return Some(Self::All);
        }
        if let Some(rest) = value.strip_prefix("source-type:") {
            return SourceType::parse(rest).map(Self::SourceType);
        }
        if let Some(rest) = value.strip_prefix("source:") {
            return Uuid::parse_str(rest).ok().map(Self::Source);
        }
        None
    }
}

impl std::fmt::Display for SourceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.storage_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_round_trips_through_str() {
        for st in [
            SourceType::UsBankCsv,
            SourceType::EuBankCsv,
            SourceType::PdfStatement,
            SourceType::GenericDelimited,
        ] {
            assert_eq!(SourceType::parse(st.as_str()), Some(st));
        }
        assert_eq!(SourceType::parse("cassette-tape"), None);
    }

    #[test]
    fn selector_storage_key_round_trips() {
        let id = Uuid::new_v4();
        for selector in [
            SourceSelector::All,
            SourceSelector::SourceType(SourceType::EuBankCsv),
            SourceSelector::Source(id),
        ] {
            assert_eq!(SourceSelector::parse(&selector.storage_key()), Some(selector));
        }
        assert_eq!(SourceSelector::parse("bogus"), None);
    }
}
