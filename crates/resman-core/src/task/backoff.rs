//! Bounded exponential backoff with jitter for pending re-entry after
//! placement failure.

use std::time::Duration;

use rand::Rng;

/// Delay before the `retry`-th re-entry to the pending queue:
/// `base * 2^retry`, capped at `max`, with up to 50% added jitter so
/// herds of failed tasks do not re-enter in lockstep.
pub fn backoff_delay(retry: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX));
    let capped = exp.min(max);
    let jitter = rand::rng().random_range(0.0..0.5);
    capped.min(max).mul_f64(1.0 + jitter).min(max.mul_f64(1.5))
}
