use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::time::{sleep, timeout};

use crate::backoff::retry_delay_ms;
use crate::breaker::{Admission, BreakerConfig, BreakerRegistry, BreakerSnapshot};
use crate::stats::{RetryStatsRegistry, RetryStatsSnapshot};
use crate::{ErrorClass, ResilienceError};

/// Outcome of classifying one failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub class: ErrorClass,
    /// Server-provided minimum wait, honored as a floor on the retry delay.
    pub retry_after_ms: Option<u64>,
}

impl From<ErrorClass> for Classification {
    fn from(class: ErrorClass) -> Self {
        Self {
            class,
            retry_after_ms: None,
        }
    }
}

/// Classifies a failed attempt so the executor can decide whether to retry.
pub type ClassifyFn = Arc<dyn Fn(&anyhow::Error) -> Classification + Send + Sync>;

/// Retry tuning for one wrapped operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    /// Shorter base used when the failure is storage lock contention.
    pub storage_busy_base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_ms: u64,
    pub jitter_enabled: bool,
    pub circuit_key: String,
}

impl RetryPolicy {
    pub fn for_circuit(circuit_key: impl Into<String>) -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            storage_busy_base_delay_ms: 50,
            max_delay_ms: 10_000,
            timeout_ms: 15_000,
            jitter_enabled: true,
            circuit_key: circuit_key.into(),
        }
    }
}

/// Executes operations under a retry policy and keyed circuit breaker.
///
/// One executor instance is shared by every component that talks to an
/// external service; circuits are isolated by `RetryPolicy::circuit_key`.
pub struct RetryExecutor {
    breakers: BreakerRegistry,
    stats: RetryStatsRegistry,
}

impl RetryExecutor {
    pub fn new(breaker_config: BreakerConfig) -> Self {
        Self {
            breakers: BreakerRegistry::new(breaker_config),
            stats: RetryStatsRegistry::new(),
        }
    }

    pub fn with_breakers(breakers: BreakerRegistry) -> Self {
        Self {
            breakers,
            stats: RetryStatsRegistry::new(),
        }
    }

    /// Runs `operation` with up to `max_retries + 1` attempts.
    ///
    /// An open circuit fails immediately without invoking the operation. Each
    /// attempt races the operation against `timeout_ms`; a timeout counts as
    /// a transient failure. Non-retryable errors and retry exhaustion record
    /// one breaker failure and surface the last error annotated with the
    /// attempt count.
    pub async fn execute<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        classify: &ClassifyFn,
        mut operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let key = policy.circuit_key.as_str();
        match self.breakers.admit(key) {
            Admission::Rejected { open_until_unix_ms } => {
                return Err(ResilienceError::CircuitOpen {
                    key: key.to_string(),
                    open_until_unix_ms,
                });
            }
            Admission::Normal | Admission::Trial => {}
        }

        self.stats.record_request(key);
        let total_attempts = policy.max_retries.saturating_add(1);
        let mut attempt = 0_usize;
        loop {
            let outcome = match timeout(
                Duration::from_millis(policy.timeout_ms.max(1)),
                operation(),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow!(
                    "operation timed out after {}ms",
                    policy.timeout_ms
                )),
            };
            attempt = attempt.saturating_add(1);

            let error = match outcome {
                Ok(value) => {
                    self.breakers.record_success(key);
                    self.stats.record_success(key);
                    return Ok(value);
                }
                Err(error) => error,
            };

            let classification = classify(&error);
            if classification.class.is_retryable() && attempt < total_attempts {
                self.stats.record_retry(key);
                let base_delay_ms = if classification.class == ErrorClass::StorageBusy {
                    policy.storage_busy_base_delay_ms
                } else {
                    policy.base_delay_ms
                };
                let delay_ms = retry_delay_ms(
                    base_delay_ms,
                    policy.max_delay_ms,
                    attempt.saturating_sub(1),
                    policy.jitter_enabled,
                    classification.retry_after_ms,
                );
                sleep(Duration::from_millis(delay_ms)).await;
                continue;
            }

            self.breakers.record_failure(key);
            self.stats.record_failure(key);
            return Err(ResilienceError::Exhausted {
                attempts: attempt,
                source: error,
            });
        }
    }

    pub fn breaker_snapshot(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshot()
    }

    pub fn stats_snapshot(&self) -> Vec<RetryStatsSnapshot> {
        self.stats.snapshot()
    }
}
