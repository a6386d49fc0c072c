//! Time and duration conversion utilities.
//!
//! Media positions arrive as floating-point seconds from pointer math and
//! configuration, while the engine works in [`Duration`]. These helpers make
//! the lossy edges explicit instead of letting `Duration::from_secs_f64` panic.

use std::time::Duration;

/// Extension trait for safe Duration conversions.
pub trait DurationExt {
    /// Convert duration to milliseconds as u64, saturating at `u64::MAX`.
    ///
    /// In practice, this is always safe because durations exceeding `u64::MAX`
    /// milliseconds would represent ~584 million years.
    fn as_millis_u64(&self) -> u64;

    /// Absolute difference between two durations.
    fn distance(&self, other: Duration) -> Duration;
}

impl DurationExt for Duration {
    fn as_millis_u64(&self) -> u64 {
        u64::try_from(self.as_millis()).unwrap_or(u64::MAX)
    }

    fn distance(&self, other: Duration) -> Duration {
        if *self > other {
            *self - other
        } else {
            other - *self
        }
    }
}

/// Convert floating-point seconds into a [`Duration`].
///
/// NaN and negative inputs become zero; values too large to represent saturate
/// at [`Duration::MAX`].
#[must_use]
pub fn duration_from_secs_lossy(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_millis_u64() {
        let duration = Duration::from_millis(1234);
        assert_eq!(duration.as_millis_u64(), 1234);
    }

    #[test]
    fn test_as_millis_u64_zero() {
        let duration = Duration::ZERO;
        assert_eq!(duration.as_millis_u64(), 0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = Duration::from_millis(1500);
        let b = Duration::from_millis(400);
        assert_eq!(a.distance(b), Duration::from_millis(1100));
        assert_eq!(b.distance(a), Duration::from_millis(1100));
    }

    #[test]
    fn test_lossy_regular_value() {
        assert_eq!(duration_from_secs_lossy(2.5), Duration::from_millis(2500));
    }

    #[test]
    fn test_lossy_nan_and_negative() {
        assert_eq!(duration_from_secs_lossy(f64::NAN), Duration::ZERO);
        assert_eq!(duration_from_secs_lossy(-3.0), Duration::ZERO);
        assert_eq!(duration_from_secs_lossy(f64::NEG_INFINITY), Duration::ZERO);
    }

    #[test]
    fn test_lossy_saturates() {
        assert_eq!(duration_from_secs_lossy(f64::INFINITY), Duration::MAX);
        assert_eq!(duration_from_secs_lossy(1e300), Duration::MAX);
    }
}
