//! Reconnect backoff: exponential growth with a ceiling, plus up to a
//! second of uniform jitter so a herd of clients does not stampede a
//! freshly restarted hub.

use rand::Rng;
use std::time::Duration;

/// Jitter ceiling added on top of the deterministic delay.
pub const JITTER_MS: u64 = 1_000;

/// Growth factor per attempt.
const FACTOR: f64 = 1.5;

/// The deterministic part: `min(max, base * 1.5^attempt)`.
pub fn base_delay_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let grown = (base_ms as f64) * FACTOR.powi(attempt.min(64) as i32);
    if grown.is_finite() {
        (grown as u64).min(max_ms)
    } else {
        max_ms
    }
}

/// Full delay for a reconnect attempt, jitter included.
pub fn delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..JITTER_MS);
    Duration::from_millis(base_delay_ms(attempt, base_ms, max_ms) + jitter)
}
