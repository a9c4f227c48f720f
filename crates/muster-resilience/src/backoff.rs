use std::sync::atomic::{AtomicU64, Ordering};

use crate::ErrorClass;

static JITTER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Maps an HTTP-style status code to an [`ErrorClass`].
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        429 => ErrorClass::RateLimited,
        408 | 425 => ErrorClass::TransientNetwork,
        value if value >= 500 => ErrorClass::TransientNetwork,
        _ => ErrorClass::Permanent,
    }
}

/// Deterministic exponential backoff: `base << attempt`, shift capped at 6.
pub fn next_backoff_ms(base_delay_ms: u64, attempt: usize) -> u64 {
    let shift = attempt.min(6);
    base_delay_ms.saturating_mul(1_u64 << shift)
}

/// Backoff with bounded jitter in [50%, 100%] of the deterministic value.
///
/// Jitter comes from a counter-mix rather than an RNG so tests stay
/// reproducible across the whole suite.
pub fn next_backoff_ms_with_jitter(base_delay_ms: u64, attempt: usize, jitter_enabled: bool) -> u64 {
    let base = next_backoff_ms(base_delay_ms, attempt);
    if !jitter_enabled || base <= 1 {
        return base;
    }

    let low = base / 2;
    let width = base.saturating_sub(low);
    let seed = JITTER_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17) ^ 0xA24B_AED4_963E_E407;
    let jitter = if width == 0 {
        0
    } else {
        mixed % width.saturating_add(1)
    };
    low.saturating_add(jitter)
}

/// Full delay computation for retry `attempt`: jittered exponential backoff
/// clipped at `max_delay_ms`, with an optional server-provided floor
/// (`retry-after`) that wins when larger.
pub fn retry_delay_ms(
    base_delay_ms: u64,
    max_delay_ms: u64,
    attempt: usize,
    jitter_enabled: bool,
    retry_after_ms: Option<u64>,
) -> u64 {
    let backoff = next_backoff_ms_with_jitter(base_delay_ms, attempt, jitter_enabled);
    let clipped = backoff.min(max_delay_ms.max(1));
    match retry_after_ms {
        Some(floor) => clipped.max(floor),
        None => clipped,
    }
}
