//! Gradual rollout admission
//!
//! Deterministic, stateless time-windowed admission: a target's session id
//! hashes to a bucket in 0..100, and the target is admitted once the elapsed
//! share of the rollout window exceeds its bucket. The same session always
//! lands at the same relative position in the window, and admission is
//! monotonic in time.

use chrono::{DateTime, Duration, Utc};

/// Bucket in 0..=99 derived from a stable session identifier.
///
/// crc32 is fixed and well distributed; it is not a security boundary.
pub fn rollout_bucket(session_id: &str) -> u32 {
    crc32fast::hash(session_id.as_bytes()) % 100
}

/// Percentage of the rollout window elapsed at `now`, clamped to 0..=100.
///
/// A zero (or negative) window means immediate full admission.
pub fn elapsed_percent(start: DateTime<Utc>, window: Duration, now: DateTime<Utc>) -> f64 {
    let window_secs = window.num_seconds();
    if window_secs <= 0 {
        return 100.0;
    }
    let elapsed_secs = (now - start).num_seconds();
    let percent = elapsed_secs as f64 / window_secs as f64 * 100.0;
    percent.clamp(0.0, 100.0)
}

/// Whether `session_id` is admitted at `now` for a rollout started at `start`.
pub fn is_admitted(
    session_id: &str,
    start: DateTime<Utc>,
    window: Duration,
    now: DateTime<Utc>,
) -> bool {
    elapsed_percent(start, window, now) > rollout_bucket(session_id) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_bucket_is_deterministic_and_in_range() {
        for session in ["a", "deploy:web:prod", "9d3f", ""] {
            let bucket = rollout_bucket(session);
            assert!(bucket < 100);
            assert_eq!(bucket, rollout_bucket(session));
        }
    }

    #[test]
    fn test_buckets_spread_across_range() {
        let buckets: std::collections::HashSet<u32> = (0..1000)
            .map(|i| rollout_bucket(&format!("target-{}", i)))
            .collect();
        // 1000 well-distributed sessions should land in most of the 100 buckets.
        assert!(buckets.len() > 80, "only {} distinct buckets", buckets.len());
    }

    #[test]
    fn test_zero_window_admits_immediately() {
        let start = at("2024-01-01T00:00:00Z");
        assert!(is_admitted("any-session", start, Duration::zero(), start));
    }

    #[test]
    fn test_elapsed_percent_clamps() {
        let start = at("2024-01-01T00:00:00Z");
        let window = Duration::minutes(60);

        assert_eq!(
            elapsed_percent(start, window, at("2023-12-31T00:00:00Z")),
            0.0
        );
        assert_eq!(
            elapsed_percent(start, window, at("2024-01-01T00:30:00Z")),
            50.0
        );
        assert_eq!(
            elapsed_percent(start, window, at("2024-01-02T00:00:00Z")),
            100.0
        );
    }

    #[test]
    fn test_admission_is_monotonic() {
        let start = at("2024-01-01T00:00:00Z");
        let window = Duration::minutes(100);

        for session in ["s1", "s2", "s3", "s4"] {
            let mut admitted_seen = false;
            for minute in 0..=101 {
                let now = start + Duration::minutes(minute);
                let admitted = is_admitted(session, start, window, now);
                if admitted_seen {
                    assert!(admitted, "{} regressed at minute {}", session, minute);
                }
                admitted_seen |= admitted;
            }
            // Every target is admitted by the end of the window.
            assert!(admitted_seen, "{} never admitted", session);
        }
    }

    #[test]
    fn test_admission_time_matches_bucket() {
        let start = at("2024-01-01T00:00:00Z");
        let window = Duration::minutes(100);
        let session = "deploy:web:prod";
        let bucket = rollout_bucket(session) as i64;

        // One minute per percent: flips from held to admitted right after the
        // bucket boundary.
        assert!(!is_admitted(
            session,
            start,
            window,
            start + Duration::minutes(bucket)
        ));
        assert!(is_admitted(
            session,
            start,
            window,
            start + Duration::minutes(bucket + 1)
        ));
    }
}
