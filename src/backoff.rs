//! Capped exponential backoff between retries.

use std::time::Duration;

pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Bases below 1 shrink the delay on every retry, so they are rejected
/// wherever a base is configured.
pub fn is_valid_base(base: f64) -> bool {
    base.is_finite() && base >= 1.0
}

/// Delay before the `attempt`-th retry becomes claimable: `min(base^attempt, 300s)`.
///
/// `attempt` is 1-based, i.e. `job.attempts + 1` at the moment of failure.
pub fn delay(attempt: u32, base: f64) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = base.powi(exponent);
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else if secs >= MAX_BACKOFF.as_secs_f64() {
        MAX_BACKOFF
    } else {
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[yare::parameterized(
        first_retry  = { 1, 2.0, Duration::from_secs(2) },
        second_retry = { 2, 2.0, Duration::from_secs(4) },
        third_retry  = { 3, 2.0, Duration::from_secs(8) },
        base_three   = { 2, 3.0, Duration::from_secs(9) },
        zero_attempt = { 0, 2.0, Duration::from_secs(1) },
        fractional   = { 1, 1.5, Duration::from_millis(1500) },
    )]
    fn exponential(attempt: u32, base: f64, expected: Duration) {
        assert_eq!(delay(attempt, base), expected);
    }

    #[yare::parameterized(
        just_over     = { 9, 2.0 },
        far_over      = { 20, 2.0 },
        huge_attempt  = { u32::MAX, 2.0 },
    )]
    fn capped_at_five_minutes(attempt: u32, base: f64) {
        assert_eq!(delay(attempt, base), MAX_BACKOFF);
    }

    #[test]
    fn degenerate_base_never_panics() {
        assert_eq!(delay(3, 0.0), Duration::ZERO);
        assert_eq!(delay(3, f64::NAN), Duration::ZERO);
        assert_eq!(delay(3, f64::INFINITY), MAX_BACKOFF);
    }

    #[yare::parameterized(
        one        = { 1.0, true },
        default    = { DEFAULT_BACKOFF_BASE, true },
        fractional = { 1.5, true },
        shrinking  = { 0.5, false },
        zero       = { 0.0, false },
        negative   = { -1.0, false },
        nan        = { f64::NAN, false },
        infinite   = { f64::INFINITY, false },
    )]
    fn base_validation(base: f64, valid: bool) {
        assert_eq!(is_valid_base(base), valid);
    }
}
