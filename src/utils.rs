//! Common utilities shared across modules.

use chrono::Utc;

/// Get current UTC time as fractional seconds since UNIX_EPOCH.
///
/// Uses chrono for accurate cross-platform timestamp.
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_timestamp() {
        let ts = unix_timestamp();
        // Should be a reasonable Unix timestamp (after 2020)
        assert!(ts > 1_577_836_800.0, "Timestamp should be after 2020-01-01");
        assert!(ts.fract() >= 0.0);
    }

    #[test]
    fn test_unix_timestamp_monotonic_enough() {
        let first = unix_timestamp();
        let second = unix_timestamp();
        assert!(second >= first);
    }
}
