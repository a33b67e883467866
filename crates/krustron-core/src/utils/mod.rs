//! Shared helpers for krustron-core

mod retry;

pub use retry::{retry_with_backoff, RetryConfig, RetryError};
