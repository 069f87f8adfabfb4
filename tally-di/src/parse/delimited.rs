//! Reference delimited-text parser
//!
//! Header-driven: the first non-empty line names the fields, every
//! following line becomes one observation. Values are captured exactly as
//! they appear, including surrounding whitespace. Ragged rows are padded or
//! truncated with a warning rather than rejected.

use crate::models::Observation;
use crate::parse::{DocumentParser, ParseError, ParseOutput, ParserWarning, RawDocument};
use std::collections::BTreeMap;

const PARSER_ID: &str = "delimited-text/1";

/// Simple single-character-delimiter text parser.
#[derive(Debug, Clone)]
pub struct DelimitedTextParser {
    delimiter: char,
}

impl DelimitedTextParser {
    pub fn new(delimiter: char) -> Self {
        Self { delimiter }
    }
}

impl Default for DelimitedTextParser {
    fn default() -> Self {
        Self::new(',')
    }
}

impl DocumentParser for DelimitedTextParser {
    fn id(&self) -> &str {
        PARSER_ID
    }

    fn parse(&self, document: &RawDocument) -> Result<ParseOutput, ParseError> {
        let mut lines = document
            .content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());

        let (header_line_no, header_line) = lines
            .next()
            .ok_or_else(|| ParseError::Corrupt("document is empty".to_string()))?;

        let header: Vec<String> = header_line
            .split(self.delimiter)
            .map(|name| name.trim().to_string())
            .collect();

        if header.iter().any(|name| name.is_empty()) {
            return Err(ParseError::Corrupt(format!(
                "header on line {} has an empty field name",
                header_line_no + 1
            )));
        }

        let mut output = ParseOutput::default();
        let extracted_at = chrono::Utc::now();
        let mut ordinal: i64 = 0;

        for (line_no, line) in lines {
            let values: Vec<&str> = line.split(self.delimiter).collect();

            if values.len() != header.len() {
                output.warnings.push(ParserWarning {
                    line: line_no + 1,
                    message: format!(
                        "row has {} fields, header has {}",
                        values.len(),
                        header.len()
                    ),
                });
            }

            // Values are stored verbatim. Missing trailing fields become
            // empty strings; extra fields are dropped (warned above).
            let mut fields = BTreeMap::new();
            for (idx, name) in header.iter().enumerate() {
                let value = values.get(idx).copied().unwrap_or("");
                fields.insert(name.clone(), value.to_string());
            }

            output.observations.push(Observation {
                source_id: document.source_id,
                ordinal,
                source_type: document.source_type,
                fields,
                parser_id: PARSER_ID.to_string(),
                extracted_at,
            });
            ordinal += 1;
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use uuid::Uuid;

    fn document(content: &str) -> RawDocument {
        RawDocument {
            source_id: Uuid::new_v4(),
            source_type: SourceType::UsBankCsv,
            content: content.to_string(),
        }
    }

    #[test]
    fn parses_rows_with_verbatim_values() {
        let parser = DelimitedTextParser::default();
        let doc = document("date,amount,description\n01/02/2024,(50.00),  Coffee  \n");
        let output = parser.parse(&doc).unwrap();

        assert_eq!(output.observations.len(), 1);
        assert!(output.warnings.is_empty());

        let obs = &output.observations[0];
        assert_eq!(obs.ordinal, 0);
        assert_eq!(obs.fields["date"], "01/02/2024");
        assert_eq!(obs.fields["amount"], "(50.00)");
        // Whitespace survives extraction untouched
        assert_eq!(obs.fields["description"], "  Coffee  ");
        assert_eq!(obs.parser_id, PARSER_ID);
    }

    #[test]
    fn ordinals_are_consecutive_from_zero() {
        let parser = DelimitedTextParser::default();
        let doc = document("date,amount,description\na,b,c\nd,e,f\ng,h,i\n");
        let output = parser.parse(&doc).unwrap();
        let ordinals: Vec<i64> = output.observations.iter().map(|o| o.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn ragged_row_warns_but_does_not_fail() {
        let parser = DelimitedTextParser::default();
        let doc = document("date,amount,description\n01/02/2024,12.00\n");
        let output = parser.parse(&doc).unwrap();

        assert_eq!(output.observations.len(), 1);
        assert_eq!(output.warnings.len(), 1);
        assert_eq!(output.warnings[0].line, 2);
        // Missing trailing field captured as empty string
        assert_eq!(output.observations[0].fields["description"], "");
    }

    #[test]
    fn empty_document_is_corrupt() {
        let parser = DelimitedTextParser::default();
        let err = parser.parse(&document("  \n \n")).unwrap_err();
        assert!(matches!(err, ParseError::Corrupt(_)));
    }

    #[test]
    fn empty_header_name_is_corrupt() {
        let parser = DelimitedTextParser::default();
        let err = parser.parse(&document("date,,description\na,b,c\n")).unwrap_err();
        assert!(matches!(err, ParseError::Corrupt(_)));
    }

    #[test]
    fn semicolon_delimiter_for_eu_exports() {
        let parser = DelimitedTextParser::new(';');
        let doc = RawDocument {
            source_id: Uuid::new_v4(),
            source_type: SourceType::EuBankCsv,
            content: "date;amount;description\n01/02/2024;50,00;Kaffee\n".to_string(),
        };
        let output = parser.parse(&doc).unwrap();
        assert_eq!(output.observations[0].fields["amount"], "50,00");
    }
}
