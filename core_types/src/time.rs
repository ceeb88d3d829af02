//! Time abstractions
//!
//! The host runtime owns the clock. Embedded code only ever sees the
//! readings the host hands over, expressed as [`Instant`]s, and spans
//! between them as [`Duration`]s.

use core::ops::{Add, Sub};
use serde::{Deserialize, Serialize};

/// A point in time on the host's monotonic clock
///
/// This is an opaque type. Under a simulated host, time is virtual and
/// only moves when the host advances it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Instant {
    /// Nanoseconds since the host's epoch
    nanos: u64,
}

impl Instant {
    /// The host's epoch
    pub const ZERO: Instant = Instant { nanos: 0 };

    /// Creates an instant from nanoseconds
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Creates an instant from milliseconds
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis.saturating_mul(1_000_000),
        }
    }

    /// Returns nanoseconds since epoch
    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Returns milliseconds since epoch
    pub const fn as_millis(&self) -> u64 {
        self.nanos / 1_000_000
    }

    /// Returns the duration since another instant
    ///
    /// Saturates to zero if `earlier` is actually later.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.nanos.saturating_sub(earlier.nanos))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, duration: Duration) -> Self::Output {
        Instant::from_nanos(self.nanos.saturating_add(duration.as_nanos()))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, duration: Duration) -> Self::Output {
        Instant::from_nanos(self.nanos.saturating_sub(duration.as_nanos()))
    }
}

/// A duration of time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Duration {
    /// Nanoseconds
    nanos: u64,
}

impl Duration {
    /// An empty duration
    pub const ZERO: Duration = Duration { nanos: 0 };

    /// Creates a duration from nanoseconds
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Creates a duration from microseconds
    pub const fn from_micros(micros: u64) -> Self {
        Self {
            nanos: micros.saturating_mul(1_000),
        }
    }

    /// Creates a duration from milliseconds
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis.saturating_mul(1_000_000),
        }
    }

    /// Creates a duration from seconds
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            nanos: secs.saturating_mul(1_000_000_000),
        }
    }

    /// Returns the duration in nanoseconds
    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Returns the duration in microseconds
    pub const fn as_micros(&self) -> u64 {
        self.nanos / 1_000
    }

    /// Returns the duration in milliseconds
    pub const fn as_millis(&self) -> u64 {
        self.nanos / 1_000_000
    }

    /// Returns the duration in seconds
    pub const fn as_secs(&self) -> u64 {
        self.nanos / 1_000_000_000
    }

    /// Returns true for a zero-length duration
    pub const fn is_zero(&self) -> bool {
        self.nanos == 0
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, other: Duration) -> Self::Output {
        Duration::from_nanos(self.nanos.saturating_add(other.nanos))
    }
}

impl Sub for Duration {
    type Output = Duration;

    fn sub(self, other: Duration) -> Self::Output {
        Duration::from_nanos(self.nanos.saturating_sub(other.nanos))
    }
}

impl From<Duration> for std::time::Duration {
    fn from(duration: Duration) -> Self {
        std::time::Duration::from_nanos(duration.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_creation() {
        let d1 = Duration::from_secs(1);
        let d2 = Duration::from_millis(1000);
        let d3 = Duration::from_micros(1_000_000);
        let d4 = Duration::from_nanos(1_000_000_000);

        assert_eq!(d1, d2);
        assert_eq!(d2, d3);
        assert_eq!(d3, d4);
    }

    #[test]
    fn test_duration_arithmetic_saturates() {
        let d1 = Duration::from_millis(500);
        let d2 = Duration::from_millis(300);

        assert_eq!(d1 + d2, Duration::from_millis(800));
        assert_eq!(d1 - d2, Duration::from_millis(200));
        assert_eq!(d2 - d1, Duration::ZERO);
    }

    #[test]
    fn test_instant_millis() {
        let i = Instant::from_millis(50);
        assert_eq!(i.as_millis(), 50);
        assert_eq!(i.as_nanos(), 50_000_000);
    }

    #[test]
    fn test_instant_duration_since() {
        let i1 = Instant::from_millis(10);
        let i2 = Instant::from_millis(30);
        assert_eq!(i2.duration_since(i1), Duration::from_millis(20));
        assert_eq!(i1.duration_since(i2), Duration::ZERO);
    }

    #[test]
    fn test_instant_arithmetic() {
        let i = Instant::from_nanos(1000);
        let d = Duration::from_nanos(500);

        assert_eq!(i + d, Instant::from_nanos(1500));
        assert_eq!(i - d, Instant::from_nanos(500));
    }

    #[test]
    fn test_std_conversion() {
        let d: std::time::Duration = Duration::from_millis(20).into();
        assert_eq!(d, std::time::Duration::from_millis(20));
    }
}
