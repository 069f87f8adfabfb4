//! Shared fixtures for integration tests

use sqlx::SqlitePool;
use std::collections::BTreeMap;
use tally_di::models::{Conventions, DateOrder, NormalizationRuleSet, SourceType};
use tally_di::parse::RawDocument;
use tally_di::store;
use tempfile::TempDir;
use uuid::Uuid;

/// File-backed pool in a temp directory, exercising the real init path.
/// The TempDir must stay alive as long as the pool.
pub async fn test_pool() -> (SqlitePool, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let pool = store::init_database_pool(&tmp.path().join("tally.db"))
        .await
        .unwrap();
    (pool, tmp)
}

/// US-interpretation rule-set: MM/DD/YYYY, dot decimal, parens negative.
pub fn us_ruleset(version: i64) -> NormalizationRuleSet {
    NormalizationRuleSet {
        version,
        default_conventions: Conventions::us(),
        overrides: BTreeMap::new(),
    }
}

/// Same amount conventions, but dates read day-first.
pub fn day_first_ruleset(version: i64) -> NormalizationRuleSet {
    NormalizationRuleSet {
        version,
        default_conventions: Conventions {
            date_order: DateOrder::DayMonthYear,
            ..Conventions::us()
        },
        overrides: BTreeMap::new(),
    }
}

/// Build a CSV statement document from (date, amount, description) rows.
pub fn statement(source_id: Uuid, rows: &[(&str, &str, &str)]) -> RawDocument {
    let mut content = String::from("date,amount,description\n");
    for (date, amount, description) in rows {
        content.push_str(&format!("{},{},{}\n", date, amount, description));
    }
    RawDocument {
        source_id,
        source_type: SourceType::UsBankCsv,
        content,
    }
}
