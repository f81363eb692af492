/// Utility functions for timestamps and time scaling
use std::time::Duration;

use time::macros::format_description;
use time::OffsetDateTime;

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    let format = format_description!("[day].[month].[year] - [hour]:[minute]:[second]");
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Sortable UTC timestamp used as the reading / queue key,
/// e.g. `20261019T125400.123456Z`.
pub fn timestamp_key(dt: &OffsetDateTime) -> String {
    let format = format_description!(
        "[year][month][day]T[hour][minute][second].[subsecond digits:6]Z"
    );
    let utc = dt.to_offset(time::UtcOffset::UTC);
    utc.format(&format)
        .unwrap_or_else(|_| format!("{:020}", utc.unix_timestamp_nanos()))
}

/// Slowest accepted time compression (100x stretched).
pub const MIN_SPEED_FACTOR: f64 = 0.01;
/// Fastest accepted time compression.
pub const MAX_SPEED_FACTOR: f64 = 10_000.0;

pub fn speed_factor_in_range(speed_factor: f64) -> bool {
    (MIN_SPEED_FACTOR..=MAX_SPEED_FACTOR).contains(&speed_factor)
}

/// Compress a nominal duration by the runtime speed factor.
///
/// NaN is treated as 1.0; anything else is clamped to the accepted range.
pub fn scale_duration(base: Duration, speed_factor: f64) -> Duration {
    let factor = if speed_factor.is_nan() {
        1.0
    } else {
        speed_factor.clamp(MIN_SPEED_FACTOR, MAX_SPEED_FACTOR)
    };
    Duration::try_from_secs_f64(base.as_secs_f64() / factor).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn timestamp_keys_sort_chronologically() {
        let a = timestamp_key(&datetime!(2026-01-02 03:04:05.000001 UTC));
        let b = timestamp_key(&datetime!(2026-01-02 03:04:05.000002 UTC));
        let c = timestamp_key(&datetime!(2026-11-02 00:00:00 UTC));
        assert_eq!(a, "20260102T030405.000001Z");
        assert!(a < b && b < c);
    }

    #[test]
    fn scale_duration_divides_by_factor() {
        assert_eq!(scale_duration(Duration::from_secs(600), 10.0), Duration::from_secs(60));
        assert_eq!(scale_duration(Duration::from_secs(600), f64::NAN), Duration::from_secs(600));
    }

    #[test]
    fn scale_duration_clamps_extreme_factors() {
        let base = Duration::from_secs(7200);
        let slowest = scale_duration(base, 1e-300);
        assert!((slowest.as_secs_f64() - 720_000.0).abs() < 1e-3, "{:?}", slowest);
        assert_eq!(scale_duration(base, 0.0), slowest);
        let fastest = scale_duration(base, f64::INFINITY);
        assert!((fastest.as_secs_f64() - 0.72).abs() < 1e-6, "{:?}", fastest);
        assert!(!speed_factor_in_range(1e-300));
        assert!(!speed_factor_in_range(1e6));
        assert!(speed_factor_in_range(1.0));
    }

    #[test]
    fn format_datetime_is_day_first() {
        let dt = datetime!(2026-10-19 08:30:00 UTC);
        assert_eq!(format_datetime(&dt), "19.10.2026 - 08:30:00");
    }
}
