//! Retry and circuit-breaker layer guarding every outbound Muster call.
//!
//! Callers wrap each chat-platform or storage operation in
//! [`RetryExecutor::execute`], which races the operation against a timeout,
//! retries transient failures with exponential backoff, and trips a per-key
//! circuit breaker after repeated failures so a degraded dependency is not
//! hammered during its outage.

pub mod backoff;
pub mod breaker;
mod executor;
pub mod stats;

pub use backoff::{classify_status, next_backoff_ms, next_backoff_ms_with_jitter, retry_delay_ms};
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, CircuitState};
pub use executor::{Classification, ClassifyFn, RetryExecutor, RetryPolicy};
pub use stats::{RetryStatsRegistry, RetryStatsSnapshot};

use thiserror::Error;

/// Classification of a failed attempt, drives retry and breaker decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection reset, timeout, interrupted transfer. Retryable.
    TransientNetwork,
    /// 429-style throttling. Retryable, counts toward breaker failures.
    RateLimited,
    /// Storage lock contention or transient I/O. Retryable with a shorter backoff.
    StorageBusy,
    /// 4xx-style client faults and everything else. Never retried.
    Permanent,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

/// Errors surfaced by the resilience layer.
#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error("circuit '{key}' is open until unix_ms {open_until_unix_ms}; call not attempted")]
    CircuitOpen { key: String, open_until_unix_ms: u64 },
    #[error("operation failed after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: anyhow::Error,
    },
}
