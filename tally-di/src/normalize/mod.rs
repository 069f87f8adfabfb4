//! Normalization engine
//!
//! Maps one raw observation plus one rule-set version to one canonical
//! record or one recorded failure. The function is pure: same observation
//! and same rule-set always produce the same output, which is what makes
//! re-processing idempotent and every canonical record reproducible. No
//! storage, no clock, no ambient configuration is consulted.

pub mod amounts;
pub mod dates;

use crate::models::{
    CanonicalRecord, FailureReason, NormalizationFailure, NormalizationRuleSet, Observation,
};
use amounts::AmountError;

/// Stateless normalizer.
#[derive(Debug, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize one observation under one rule-set.
    ///
    /// Conventions are resolved from the observation's source type through
    /// the rule-set. A failure describes this record only; the caller keeps
    /// processing its batch.
    pub fn normalize(
        &self,
        observation: &Observation,
        rules: &NormalizationRuleSet,
    ) -> Result<CanonicalRecord, NormalizationFailure> {
        let conventions = rules.resolve(observation.source_type);

        let raw_date = required_field(observation, &conventions.fields.date)?;
        let raw_amount = required_field(observation, &conventions.fields.amount)?;
        let raw_description = required_field(observation, &conventions.fields.description)?;

        let posted_on = dates::parse_date(raw_date, conventions.date_order).map_err(|detail| {
            NormalizationFailure::new(
                FailureReason::UnparseableDate,
                Some(&conventions.fields.date),
                detail,
            )
        })?;

        let amount = amounts::parse_amount(raw_amount, &conventions.amount).map_err(|err| {
            let reason = match err {
                AmountError::AmbiguousSign(_) => FailureReason::AmbiguousAmountSign,
                AmountError::Unparseable(_) => FailureReason::UnparseableAmount,
            };
            NormalizationFailure::new(reason, Some(&conventions.fields.amount), err.to_string())
        })?;

        let description = clean_description(raw_description);
        if description.is_empty() {
            return Err(NormalizationFailure::new(
                FailureReason::MissingField,
                Some(&conventions.fields.description),
                "description is empty after cleanup",
            ));
        }

        let record_key = CanonicalRecord::derive_key(posted_on, amount, &description);

        Ok(CanonicalRecord {
            record_key,
            posted_on,
            amount,
            description,
            source_id: observation.source_id,
            ordinal: observation.ordinal,
            ruleset_version: rules.version,
        })
    }
}

fn required_field<'a>(
    observation: &'a Observation,
    name: &str,
) -> Result<&'a str, NormalizationFailure> {
    observation
        .fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| {
            NormalizationFailure::new(
                FailureReason::MissingField,
                Some(name),
                format!("observation has no field {:?}", name),
            )
        })
}

/// Trim and collapse internal whitespace runs to single spaces.
fn clean_description(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Amount, Conventions, SourceType};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn observation(fields: &[(&str, &str)], source_type: SourceType) -> Observation {
        Observation {
            source_id: Uuid::new_v4(),
            ordinal: 0,
            source_type,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            parser_id: "test/1".to_string(),
            extracted_at: chrono::Utc::now(),
        }
    }

    fn us_rules(version: i64) -> NormalizationRuleSet {
        NormalizationRuleSet {
            version,
            default_conventions: Conventions::us(),
            overrides: BTreeMap::new(),
        }
    }

    fn eu_rules(version: i64) -> NormalizationRuleSet {
        NormalizationRuleSet {
            version,
            default_conventions: Conventions {
                date_order: crate::models::DateOrder::DayMonthYear,
                ..Conventions::us()
            },
            overrides: BTreeMap::new(),
        }
    }

    #[test]
    fn normalizes_the_reference_observation() {
        let obs = observation(
            &[
                ("date", "01/02/2024"),
                ("amount", "(50.00)"),
                ("description", "  Coffee  "),
            ],
            SourceType::UsBankCsv,
        );

        let record = Normalizer::new().normalize(&obs, &us_rules(1)).unwrap();
        assert_eq!(record.posted_on, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(record.amount, Amount::new(-5000, 2));
        assert_eq!(record.description, "Coffee");
        assert_eq!(record.ruleset_version, 1);
        assert_eq!(record.source_id, obs.source_id);
        assert_eq!(record.ordinal, 0);
    }

    #[test]
    fn same_observation_different_rules_reinterprets_date() {
        let obs = observation(
            &[
                ("date", "01/02/2024"),
                ("amount", "(50.00)"),
                ("description", "Coffee"),
            ],
            SourceType::UsBankCsv,
        );

        let normalizer = Normalizer::new();
        let v1 = normalizer.normalize(&obs, &us_rules(1)).unwrap();
        let v2 = normalizer.normalize(&obs, &eu_rules(2)).unwrap();

        assert_eq!(v1.posted_on, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(v2.posted_on, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(v1.amount, v2.amount);
        assert_ne!(v1.record_key, v2.record_key, "date change moves the business key");
    }

    #[test]
    fn normalize_is_deterministic() {
        let obs = observation(
            &[
                ("date", "12/31/2024"),
                ("amount", "1,234.56"),
                ("description", "Year  end   sweep"),
            ],
            SourceType::UsBankCsv,
        );

        let normalizer = Normalizer::new();
        let rules = us_rules(7);
        let first = normalizer.normalize(&obs, &rules).unwrap();
        let second = normalizer.normalize(&obs, &rules).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.description, "Year end sweep");
    }

    #[test]
    fn failures_carry_reason_codes() {
        let normalizer = Normalizer::new();
        let rules = us_rules(1);

        let bad_date = observation(
            &[("date", "99/99/2024"), ("amount", "1.00"), ("description", "x")],
            SourceType::UsBankCsv,
        );
        assert_eq!(
            normalizer.normalize(&bad_date, &rules).unwrap_err().reason,
            FailureReason::UnparseableDate
        );

        let ambiguous = observation(
            &[("date", "01/02/2024"), ("amount", "(-50.00)"), ("description", "x")],
            SourceType::UsBankCsv,
        );
        assert_eq!(
            normalizer.normalize(&ambiguous, &rules).unwrap_err().reason,
            FailureReason::AmbiguousAmountSign
        );

        let missing = observation(
            &[("date", "01/02/2024"), ("description", "x")],
            SourceType::UsBankCsv,
        );
        let failure = normalizer.normalize(&missing, &rules).unwrap_err();
        assert_eq!(failure.reason, FailureReason::MissingField);
        assert_eq!(failure.field.as_deref(), Some("amount"));

        let blank_description = observation(
            &[("date", "01/02/2024"), ("amount", "1.00"), ("description", "   ")],
            SourceType::UsBankCsv,
        );
        assert_eq!(
            normalizer
                .normalize(&blank_description, &rules)
                .unwrap_err()
                .reason,
            FailureReason::MissingField
        );
    }

    #[test]
    fn source_type_override_selects_conventions() {
        let mut overrides = BTreeMap::new();
        overrides.insert(SourceType::EuBankCsv, Conventions::eu());
        let rules = NormalizationRuleSet {
            version: 1,
            default_conventions: Conventions::us(),
            overrides,
        };

        let obs = observation(
            &[("date", "01/02/2024"), ("amount", "50,00"), ("description", "Kaffee")],
            SourceType::EuBankCsv,
        );
        let record = Normalizer::new().normalize(&obs, &rules).unwrap();
        assert_eq!(record.posted_on, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(record.amount, Amount::new(5000, 2));
    }
}
