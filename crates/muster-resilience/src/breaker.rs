use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use muster_core::current_unix_timestamp_ms;

type ClockFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Breaker tuning shared by every circuit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub failure_threshold: usize,
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
            cooldown_ms: 30_000,
        }
    }
}

/// Observable state of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Default)]
struct CircuitRecord {
    consecutive_failures: usize,
    open_until_unix_ms: Option<u64>,
    trial_in_flight: bool,
    last_failure_unix_ms: Option<u64>,
}

/// Point-in-time view of one circuit for observability callers.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub open_until_unix_ms: Option<u64>,
    pub last_failure_unix_ms: Option<u64>,
    pub failure_threshold: usize,
    pub cooldown_ms: u64,
}

/// Outcome of asking a circuit whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, call proceeds normally.
    Normal,
    /// Cooldown elapsed; this call is the single half-open trial.
    Trial,
    /// Circuit open (or trial already in flight); call must not run.
    Rejected { open_until_unix_ms: u64 },
}

/// Keyed circuit-breaker registry. One record per circuit key, mutated only
/// through this registry.
pub struct BreakerRegistry {
    config: BreakerConfig,
    circuits: Mutex<HashMap<String, CircuitRecord>>,
    clock: ClockFn,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(current_unix_timestamp_ms))
    }

    pub fn with_clock(config: BreakerConfig, clock: ClockFn) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Decides whether a call keyed by `key` may run right now.
    pub fn admit(&self, key: &str) -> Admission {
        if !self.config.enabled {
            return Admission::Normal;
        }
        let now = (self.clock)();
        let mut circuits = lock_or_recover(&self.circuits);
        let record = circuits.entry(key.to_string()).or_default();

        match record.open_until_unix_ms {
            Some(open_until) if now < open_until => Admission::Rejected {
                open_until_unix_ms: open_until,
            },
            Some(open_until) => {
                if record.trial_in_flight {
                    return Admission::Rejected {
                        open_until_unix_ms: open_until,
                    };
                }
                record.trial_in_flight = true;
                Admission::Trial
            }
            None => Admission::Normal,
        }
    }

    /// Resets the circuit to closed after a successful call.
    pub fn record_success(&self, key: &str) {
        let mut circuits = lock_or_recover(&self.circuits);
        let record = circuits.entry(key.to_string()).or_default();
        record.consecutive_failures = 0;
        record.open_until_unix_ms = None;
        record.trial_in_flight = false;
    }

    /// Counts one failure. Returns the open-until timestamp when this failure
    /// trips (or re-trips) the circuit.
    pub fn record_failure(&self, key: &str) -> Option<u64> {
        if !self.config.enabled {
            return None;
        }
        let now = (self.clock)();
        let mut circuits = lock_or_recover(&self.circuits);
        let record = circuits.entry(key.to_string()).or_default();
        record.last_failure_unix_ms = Some(now);

        // A failed half-open trial reopens immediately with a fresh cooldown.
        if record.trial_in_flight {
            record.trial_in_flight = false;
            record.consecutive_failures = 0;
            let open_until = now.saturating_add(self.config.cooldown_ms);
            record.open_until_unix_ms = Some(open_until);
            return Some(open_until);
        }

        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        let threshold = self.config.failure_threshold.max(1);
        if record.consecutive_failures < threshold {
            return None;
        }
        record.consecutive_failures = 0;
        let open_until = now.saturating_add(self.config.cooldown_ms);
        record.open_until_unix_ms = Some(open_until);
        Some(open_until)
    }

    /// Snapshots every known circuit, sorted by key.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = (self.clock)();
        let circuits = lock_or_recover(&self.circuits);
        let mut snapshots = circuits
            .iter()
            .map(|(key, record)| BreakerSnapshot {
                key: key.clone(),
                state: record_state(record, now),
                consecutive_failures: record.consecutive_failures,
                open_until_unix_ms: record.open_until_unix_ms,
                last_failure_unix_ms: record.last_failure_unix_ms,
                failure_threshold: self.config.failure_threshold,
                cooldown_ms: self.config.cooldown_ms,
            })
            .collect::<Vec<_>>();
        snapshots.sort_by(|left, right| left.key.cmp(&right.key));
        snapshots
    }
}

fn record_state(record: &CircuitRecord, now_unix_ms: u64) -> CircuitState {
    match record.open_until_unix_ms {
        Some(open_until) if now_unix_ms < open_until => CircuitState::Open,
        Some(_) => CircuitState::HalfOpen,
        None => CircuitState::Closed,
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
