//! Retry timing
//!
//! A job that failed on its k-th attempt is republished after `k² × unit`.
//! With the default one-second unit that is 1s, 4s, 9s, ...

use std::time::Duration;

/// Default backoff unit (one second)
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Quadratic backoff delay for a job that has been attempted `attempts` times
pub fn quadratic_backoff(attempts: u32, unit: Duration) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;

    let k = u128::from(attempts);
    let nanos = unit.as_nanos().saturating_mul(k * k);
    match u64::try_from(nanos / NANOS_PER_SEC) {
        Ok(secs) => Duration::new(secs, (nanos % NANOS_PER_SEC) as u32),
        Err(_) => Duration::MAX,
    }
}
