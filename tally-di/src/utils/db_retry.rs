//! Database retry logic
//!
//! Exponential backoff retry for transient SQLite lock errors. The total
//! retry budget comes from the di.database_max_lock_wait_ms setting.

use std::time::{Duration, Instant};

/// Errors that may represent transient database lock contention.
pub trait RetryableError {
    fn is_database_locked(&self) -> bool;
}

impl RetryableError for tally_common::Error {
    fn is_database_locked(&self) -> bool {
        match self {
            tally_common::Error::Database(db_err) => {
                db_err.to_string().contains("database is locked")
            }
            _ => false,
        }
    }
}

impl RetryableError for crate::store::StoreError {
    fn is_database_locked(&self) -> bool {
        match self {
            crate::store::StoreError::Storage(db_err) => {
                db_err.to_string().contains("database is locked")
            }
            _ => false,
        }
    }
}

/// Retry a database operation with exponential backoff until max_wait_ms
/// elapses.
///
/// **Algorithm:**
/// 1. Attempt operation
/// 2. If successful, return result
/// 3. If "database is locked" error:
///    a. If time elapsed < max_wait_ms: log WARN, backoff, retry
///    b. If time elapsed >= max_wait_ms: log ERROR, return the error
/// 4. If other error: return error immediately (no retry)
///
/// **Backoff strategy:** 10ms initial delay, doubled each attempt, capped
/// at 1000ms.
pub async fn retry_on_lock<F, Fut, T, E>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: RetryableError,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0;
    let mut backoff_ms = 10u64;

    loop {
        attempt += 1;

        if attempt > 1 {
            tracing::debug!(
                operation = operation_name,
                attempt,
                "Retrying database operation"
            );
        }

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Database operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_database_locked() {
                    // Non-lock error, fail immediately
                    return Err(err);
                }

                let elapsed = start_time.elapsed();
                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        max_wait_ms,
                        "Database operation failed: max retry time exceeded"
                    );
                    return Err(err);
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    backoff_ms,
                    "Database locked, will retry after backoff"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(1000);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn locked_error() -> StoreError {
        StoreError::Storage(sqlx::Error::Protocol("database is locked".to_string()))
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let result: Result<i32, StoreError> =
            retry_on_lock("test_op", 5000, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_lock_errors_until_success() {
        let attempts = AtomicU32::new(0);

        let result: Result<i32, StoreError> = retry_on_lock("test_op", 5000, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(locked_error())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_wait() {
        let result: Result<i32, StoreError> =
            retry_on_lock("test_op", 30, || async { Err(locked_error()) }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn non_lock_error_fails_immediately() {
        let attempts = AtomicU32::new(0);

        let result: Result<i32, StoreError> = retry_on_lock("test_op", 5000, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(StoreError::InvalidAppend("not a lock problem".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
