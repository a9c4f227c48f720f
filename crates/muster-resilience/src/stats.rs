use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default)]
struct RetryCounters {
    total_requests: u64,
    total_retries: u64,
    successes: u64,
    failures: u64,
}

/// Per-key retry counters surfaced to observability callers.
#[derive(Debug, Clone, Serialize)]
pub struct RetryStatsSnapshot {
    pub key: String,
    pub total_requests: u64,
    pub total_retries: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Process-lifetime retry counters, keyed by circuit key.
#[derive(Default)]
pub struct RetryStatsRegistry {
    counters: Mutex<HashMap<String, RetryCounters>>,
}

impl RetryStatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, key: &str) {
        self.update(key, |counters| {
            counters.total_requests = counters.total_requests.saturating_add(1);
        });
    }

    pub fn record_retry(&self, key: &str) {
        self.update(key, |counters| {
            counters.total_retries = counters.total_retries.saturating_add(1);
        });
    }

    pub fn record_success(&self, key: &str) {
        self.update(key, |counters| {
            counters.successes = counters.successes.saturating_add(1);
        });
    }

    pub fn record_failure(&self, key: &str) {
        self.update(key, |counters| {
            counters.failures = counters.failures.saturating_add(1);
        });
    }

    pub fn snapshot(&self) -> Vec<RetryStatsSnapshot> {
        let counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut snapshots = counters
            .iter()
            .map(|(key, value)| RetryStatsSnapshot {
                key: key.clone(),
                total_requests: value.total_requests,
                total_retries: value.total_retries,
                successes: value.successes,
                failures: value.failures,
            })
            .collect::<Vec<_>>();
        snapshots.sort_by(|left, right| left.key.cmp(&right.key));
        snapshots
    }

    fn update(&self, key: &str, apply: impl FnOnce(&mut RetryCounters)) {
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(counters.entry(key.to_string()).or_default());
    }
}

#[cfg(test)]
mod tests {
    use super::RetryStatsRegistry;

    #[test]
    fn counters_accumulate_per_key() {
        let stats = RetryStatsRegistry::new();
        stats.record_request("chat");
        stats.record_retry("chat");
        stats.record_retry("chat");
        stats.record_success("chat");
        stats.record_request("storage");
        stats.record_failure("storage");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].key, "chat");
        assert_eq!(snapshot[0].total_requests, 1);
        assert_eq!(snapshot[0].total_retries, 2);
        assert_eq!(snapshot[0].successes, 1);
        assert_eq!(snapshot[1].key, "storage");
        assert_eq!(snapshot[1].failures, 1);
    }
}
