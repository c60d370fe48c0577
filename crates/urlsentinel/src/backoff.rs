//! Backoff schedules for update and full-hash failures.

use rand::Rng;

/// Next update wait after `errors` consecutive failures, in seconds.
///
/// The randomized tiers spread rebuilding clients out instead of letting
/// them stampede the service on the same second.
pub fn update_backoff_secs(errors: u32) -> i64 {
    match errors {
        0 | 1 => 60,
        2 => jitter(30 * 60, 60 * 60),
        3 => jitter(60 * 60, 120 * 60),
        4 => jitter(120 * 60, 240 * 60),
        5 => jitter(240 * 60, 480 * 60),
        _ => 480 * 60,
    }
}

fn jitter(min: i64, max: i64) -> i64 {
    rand::thread_rng().gen_range(min..=max)
}

/// How long full-hash requests for a prefix stay throttled after `errors`
/// consecutive failures, in seconds. The second failure is tolerated.
pub fn full_hash_throttle_secs(errors: u32) -> i64 {
    match errors {
        0 | 2 => 0,
        1 => 5 * 60,
        3 => 30 * 60,
        4 => 60 * 60,
        _ => 120 * 60,
    }
}

/// Whether a prefix that failed `errors` times, most recently at `last`,
/// may be requested again at `now`.
pub fn full_hash_allowed(errors: u32, last: i64, now: i64) -> bool {
    now >= last + full_hash_throttle_secs(errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_backoff_within_bounds() {
        for _ in 0..50 {
            assert_eq!(update_backoff_secs(1), 60);
            assert!((1800..=3600).contains(&update_backoff_secs(2)));
            assert!((3600..=7200).contains(&update_backoff_secs(3)));
            assert!((7200..=14400).contains(&update_backoff_secs(4)));
            assert!((14400..=28800).contains(&update_backoff_secs(5)));
            assert_eq!(update_backoff_secs(6), 28800);
            assert_eq!(update_backoff_secs(12), 28800);
        }
    }

    #[test]
    fn test_full_hash_throttle_schedule() {
        assert_eq!(full_hash_throttle_secs(1), 300);
        assert_eq!(full_hash_throttle_secs(2), 0);
        assert_eq!(full_hash_throttle_secs(3), 1800);
        assert_eq!(full_hash_throttle_secs(4), 3600);
        assert_eq!(full_hash_throttle_secs(5), 7200);
        assert_eq!(full_hash_throttle_secs(9), 7200);
    }

    #[test]
    fn test_full_hash_allowed_window() {
        let now = 10_000;
        assert!(!full_hash_allowed(1, now - 299, now));
        assert!(full_hash_allowed(1, now - 300, now));
        assert!(full_hash_allowed(2, now, now));
        assert!(!full_hash_allowed(5, now - 7199, now));
    }
}
