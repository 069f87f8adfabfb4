//! Parser boundary
//!
//! Parsers convert source documents into raw observations. They perform no
//! interpretation: every field value is captured verbatim, suspicious data
//! produces a warning on the side channel, and only a structurally broken
//! document fails the parse. Semantic validation belongs to the normalizer.

pub mod delimited;

use crate::models::{Observation, SourceType};
use thiserror::Error;
use uuid::Uuid;

pub use delimited::DelimitedTextParser;

/// A source document handed to a parser.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub source_id: Uuid,
    pub source_type: SourceType,
    pub content: String,
}

/// Non-fatal parser diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserWarning {
    /// 1-based line number in the source document
    pub line: usize,
    pub message: String,
}

/// Result of a successful parse: observations plus the warning side channel.
#[derive(Debug, Clone, Default)]
pub struct ParseOutput {
    pub observations: Vec<Observation>,
    pub warnings: Vec<ParserWarning>,
}

/// Fatal parse errors.
///
/// Corrupt documents are not retryable; the coordinator fails the unit of
/// work without re-invoking the parser.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document corrupt: {0}")]
    Corrupt(String),
}

/// A format-specific document parser.
///
/// Implementations must emit observations with verbatim field values and
/// consecutive ordinals starting at zero.
pub trait DocumentParser: Send + Sync {
    /// Parser identity and version, recorded on every observation.
    fn id(&self) -> &str;

    fn parse(&self, document: &RawDocument) -> Result<ParseOutput, ParseError>;
}

/// Resolve the built-in parser for a source type.
///
/// PDF statements have no built-in parser: their text extraction is an
/// external collaborator that submits observations through the same append
/// path.
pub fn parser_for(source_type: SourceType) -> Option<Box<dyn DocumentParser>> {
    match source_type {
        SourceType::UsBankCsv | SourceType::GenericDelimited => {
            Some(Box::new(DelimitedTextParser::new(',')))
        }
        SourceType::EuBankCsv => Some(Box::new(DelimitedTextParser::new(';'))),
        SourceType::PdfStatement => None,
    }
}
