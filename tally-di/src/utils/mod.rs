//! Shared utilities for tally-di

pub mod db_retry;

pub use db_retry::{retry_on_lock, RetryableError};
