//! General time utility functions

use chrono;

/// Number of nanoseconds in a second
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Convert a duration into a number of seconds, or `None` if overflow
pub fn duration_to_seconds(duration: chrono::Duration) -> Option<f64> {
    duration
        .num_nanoseconds()
        .map(|ns| ns as f64 / NANOS_PER_SECOND as f64)
}

/// Convert a number of seconds into a `std::time::Duration`, saturating negative or non-finite
/// values to zero.
pub fn seconds_to_std(seconds: f64) -> std::time::Duration {
    if seconds.is_finite() && seconds > 0.0 {
        std::time::Duration::from_secs_f64(seconds)
    }
    else {
        std::time::Duration::from_secs(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_duration_to_seconds() {
        assert_eq!(duration_to_seconds(chrono::Duration::milliseconds(1500)), Some(1.5));
    }

    #[test]
    fn test_seconds_to_std() {
        assert_eq!(seconds_to_std(0.25), std::time::Duration::from_millis(250));
        assert_eq!(seconds_to_std(-1.0), std::time::Duration::from_secs(0));
        assert_eq!(seconds_to_std(f64::NAN), std::time::Duration::from_secs(0));
    }
}
