//! Retry backoff schedule shared by `nack` and the reaper.

use std::time::Duration;

/// Base delay applied on the first retry.
pub const BASE_DELAY: Duration = Duration::from_secs(30);
/// Ceiling on the retry delay.
pub const MAX_DELAY: Duration = Duration::from_secs(3600);

/// Exponential retry delay: `min(2^attempts * 30s, 3600s)`.
///
/// `attempts` is the number of failed tries so far, so the first retry
/// (one failure) waits 60 seconds.
pub fn backoff(attempts: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempts);
    let secs = exp.saturating_mul(BASE_DELAY.as_secs());
    Duration::from_secs(secs.min(MAX_DELAY.as_secs()))
}

/// Poll sleep with random jitter added to reduce thundering-herd effects
/// when several workers poll an empty queue simultaneously.
pub(crate) fn jittered(poll_interval: Duration, jitter: Duration) -> Duration {
    use rand::Rng;

    if jitter.is_zero() {
        return poll_interval;
    }

    let jitter_millis = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
    poll_interval + Duration::from_millis(random_jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_matches_the_documented_table() {
        let expected = [30, 60, 120, 240, 480, 960, 1920, 3600, 3600];
        for (attempts, secs) in expected.into_iter().enumerate() {
            assert_eq!(
                backoff(attempts as u32),
                Duration::from_secs(secs),
                "attempts = {attempts}"
            );
        }
    }

    #[test]
    fn large_attempt_counts_saturate_at_the_ceiling() {
        assert_eq!(backoff(64), MAX_DELAY);
        assert_eq!(backoff(u32::MAX), MAX_DELAY);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(2);
        let jitter = Duration::from_millis(100);
        for _ in 0..50 {
            let d = jittered(base, jitter);
            assert!(d >= base);
            assert!(d <= base + jitter);
        }
        assert_eq!(jittered(base, Duration::ZERO), base);
    }
}
