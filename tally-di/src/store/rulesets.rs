//! Rule-set registry
//!
//! Append-only by version number. A published rule-set is immutable:
//! republishing an existing version or publishing a version that does not
//! exceed the current maximum is rejected, because a version's behavior
//! must never change once it has produced canonical records.

use crate::models::NormalizationRuleSet;
use sqlx::{Row, SqlitePool};
use tally_common::{Error, Result};

/// Publish a new rule-set version.
///
/// Versions must be strictly greater than every previously published
/// version (total order, monotonic).
pub async fn publish(pool: &SqlitePool, ruleset: &NormalizationRuleSet) -> Result<()> {
    let policy = serde_json::to_string(ruleset)
        .map_err(|e| Error::Internal(format!("Failed to serialize rule-set: {}", e)))?;

    let max_version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM rulesets")
        .fetch_one(pool)
        .await?;

    if let Some(max) = max_version {
        if ruleset.version <= max {
            return Err(Error::RuleSet(format!(
                "version {} is not greater than latest published version {}",
                ruleset.version, max
            )));
        }
    }

    sqlx::query("INSERT INTO rulesets (version, policy, published_at) VALUES (?, ?, ?)")
        .bind(ruleset.version)
        .bind(&policy)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(pool)
        .await?;

    tracing::info!(version = ruleset.version, "Rule-set published");

    Ok(())
}

/// Fetch one published rule-set by version.
pub async fn get(pool: &SqlitePool, version: i64) -> Result<Option<NormalizationRuleSet>> {
    let policy: Option<String> = sqlx::query_scalar("SELECT policy FROM rulesets WHERE version = ?")
        .bind(version)
        .fetch_optional(pool)
        .await?;

    policy
        .map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| Error::Internal(format!("Failed to deserialize rule-set: {}", e)))
        })
        .transpose()
}

/// The highest published rule-set, if any.
pub async fn latest(pool: &SqlitePool) -> Result<Option<NormalizationRuleSet>> {
    let policy: Option<String> =
        sqlx::query_scalar("SELECT policy FROM rulesets ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    policy
        .map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| Error::Internal(format!("Failed to deserialize rule-set: {}", e)))
        })
        .transpose()
}

/// All published versions in ascending order.
pub async fn versions(pool: &SqlitePool) -> Result<Vec<i64>> {
    let rows = sqlx::query("SELECT version FROM rulesets ORDER BY version")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|row| row.get("version")).collect())
}
