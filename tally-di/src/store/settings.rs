//! Service settings persistence
//!
//! String key/value table with compiled defaults. Settings are read at the
//! point of use so operators can adjust a running service.

use sqlx::SqlitePool;
use tally_common::Result;

pub const KEY_MAX_LOCK_WAIT_MS: &str = "di.database_max_lock_wait_ms";
pub const KEY_PAGE_SIZE: &str = "di.observation_page_size";
pub const KEY_FAIL_ON_PARTIAL: &str = "di.ingest_fail_on_partial";
pub const KEY_RETENTION_DAYS: &str = "di.observation_retention_days";

pub const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;
pub const DEFAULT_PAGE_SIZE: i64 = 256;

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// Maximum total time to retry a locked database operation.
pub async fn max_lock_wait_ms(pool: &SqlitePool) -> u64 {
    read_parsed(pool, KEY_MAX_LOCK_WAIT_MS)
        .await
        .unwrap_or(DEFAULT_MAX_LOCK_WAIT_MS)
}

/// Page size for keyset-paginated observation reads.
pub async fn observation_page_size(pool: &SqlitePool) -> i64 {
    read_parsed(pool, KEY_PAGE_SIZE)
        .await
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_PAGE_SIZE)
}

/// When true, a unit of work with any per-record failure terminates as
/// Failed instead of Completed.
pub async fn fail_on_partial(pool: &SqlitePool) -> bool {
    read_parsed(pool, KEY_FAIL_ON_PARTIAL).await.unwrap_or(false)
}

/// Observation retention window in days. None means keep forever.
pub async fn retention_days(pool: &SqlitePool) -> Option<i64> {
    read_parsed(pool, KEY_RETENTION_DAYS)
        .await
        .filter(|days| *days > 0)
}

async fn read_parsed<T: std::str::FromStr>(pool: &SqlitePool, key: &str) -> Option<T> {
    match get_setting(pool, key).await {
        Ok(value) => value.and_then(|v| v.parse().ok()),
        Err(e) => {
            tracing::warn!(key, error = %e, "Failed to read setting, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory_pool;

    #[tokio::test]
    async fn defaults_apply_when_unset() {
        let pool = memory_pool().await;
        assert_eq!(max_lock_wait_ms(&pool).await, DEFAULT_MAX_LOCK_WAIT_MS);
        assert_eq!(observation_page_size(&pool).await, DEFAULT_PAGE_SIZE);
        assert!(!fail_on_partial(&pool).await);
        assert_eq!(retention_days(&pool).await, None);
    }

    #[tokio::test]
    async fn set_and_read_back() {
        let pool = memory_pool().await;
        set_setting(&pool, KEY_PAGE_SIZE, "64").await.unwrap();
        assert_eq!(observation_page_size(&pool).await, 64);

        set_setting(&pool, KEY_FAIL_ON_PARTIAL, "true").await.unwrap();
        assert!(fail_on_partial(&pool).await);

        // Overwrite keeps a single row
        set_setting(&pool, KEY_PAGE_SIZE, "128").await.unwrap();
        assert_eq!(observation_page_size(&pool).await, 128);
    }

    #[tokio::test]
    async fn garbage_values_fall_back_to_defaults() {
        let pool = memory_pool().await;
        set_setting(&pool, KEY_PAGE_SIZE, "not-a-number").await.unwrap();
        assert_eq!(observation_page_size(&pool).await, DEFAULT_PAGE_SIZE);

        set_setting(&pool, KEY_PAGE_SIZE, "-5").await.unwrap();
        assert_eq!(observation_page_size(&pool).await, DEFAULT_PAGE_SIZE);
    }
}
