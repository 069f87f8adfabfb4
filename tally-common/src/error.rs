//! Error taxonomy shared across the Tally services

use thiserror::Error;

/// Shared result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors common to the Tally pipeline services.
///
/// Database and I/O failures wrap their sources and form the retryable
/// class; the remaining variants describe conditions a retry cannot fix
/// (bad configuration, registry violations, broken invariants).
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem operation failed (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rule-set registry violation: a republished version, an
    /// out-of-order version number, or a version that was never
    /// published. Rule-sets are immutable and totally ordered, so none
    /// of these can be retried into success.
    #[error("Rule-set error: {0}")]
    RuleSet(String),

    /// Broken invariant or undecodable persisted state
    #[error("Internal error: {0}")]
    Internal(String),
}
