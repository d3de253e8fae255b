//! ---
//! tach_section: "01-core-functionality"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Shared primitives and utilities for the harness runtime."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::time::Duration;

/// Real time needed to cover `virtual_span` at the given acceleration factor.
///
/// Rounded up to whole microseconds so a sleep of the returned length never
/// covers less virtual time than requested.
pub fn virtual_to_real(virtual_span: Duration, factor: f64) -> Duration {
    let micros = (virtual_span.as_secs_f64() * 1_000_000.0 / factor).ceil();
    if !micros.is_finite() || micros >= u64::MAX as f64 {
        return Duration::MAX;
    }
    Duration::from_micros(micros as u64)
}

/// Virtual time covered by `real_span` at the given acceleration factor, saturating.
pub fn real_to_virtual(real_span: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(real_span.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Convert a std duration into a chrono duration, clamping absurd spans to ~1000 years.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365_000))
}

/// Convert a duration into microseconds, saturating at `u64::MAX`.
pub fn duration_to_micros(duration: Duration) -> u64 {
    duration
        .as_secs()
        .saturating_mul(1_000_000)
        .saturating_add(u64::from(duration.subsec_micros()))
}

/// Signed difference between an observed and an expected duration in microseconds.
pub fn jitter_us(actual: Duration, expected: Duration) -> i64 {
    let actual_us = actual.as_secs_f64() * 1_000_000.0;
    let expected_us = expected.as_secs_f64() * 1_000_000.0;
    (actual_us - expected_us).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_is_symmetric() {
        let span = Duration::from_secs(3600);
        let real = virtual_to_real(span, 100.0);
        assert_eq!(real, Duration::from_secs(36));
        assert_eq!(real_to_virtual(real, 100.0), span);
    }

    #[test]
    fn real_span_rounds_up() {
        let real = virtual_to_real(Duration::from_secs(10), 3.0);
        assert_eq!(real, Duration::from_micros(3_333_334));
        assert!(real_to_virtual(real, 3.0) >= Duration::from_secs(10));
    }

    #[test]
    fn scaling_saturates() {
        assert_eq!(real_to_virtual(Duration::MAX, 1000.0), Duration::MAX);
    }

    #[test]
    fn jitter_is_signed() {
        assert_eq!(
            jitter_us(Duration::from_millis(12), Duration::from_millis(10)),
            2_000
        );
        assert_eq!(
            jitter_us(Duration::from_millis(8), Duration::from_millis(10)),
            -2_000
        );
        assert_eq!(duration_to_micros(Duration::from_millis(3)), 3_000);
    }
}
