//! Core type definitions for the runtime.
//!
//! Logical time is measured in nanoseconds elapsed since the start of the
//! execution (or of the federation), so the start tag is always `(0, 0)`.

/// A point in logical or physical time, in nanoseconds since start.
pub type Instant = i64;

/// A signed duration in nanoseconds.
pub type Interval = i64;

/// Superdense time index within one instant.
pub type Microstep = u32;

/// Index of a reactor instance in a [`Program`](crate::graph::Program).
pub type ReactorId = usize;

/// Global index of a reaction in a [`Program`](crate::graph::Program).
pub type ReactionId = usize;

/// Index of a port in a [`Program`](crate::graph::Program).
pub type PortId = usize;

/// Index of an action in a [`Program`](crate::graph::Program).
pub type ActionId = usize;

/// Index of a timer in a [`Program`](crate::graph::Program).
pub type TimerId = usize;

/// Identifier of a federate, as carried in wire headers.
pub type FederateId = u16;

/// Nanoseconds in one microsecond.
pub const NANOS_PER_USEC: Interval = 1_000;
/// Nanoseconds in one millisecond.
pub const NANOS_PER_MSEC: Interval = 1_000_000;
/// Nanoseconds in one second.
pub const NANOS_PER_SEC: Interval = 1_000_000_000;

/// Returns `n` microseconds as an [`Interval`].
#[inline]
pub const fn usec(n: i64) -> Interval {
    n * NANOS_PER_USEC
}

/// Returns `n` milliseconds as an [`Interval`].
#[inline]
pub const fn msec(n: i64) -> Interval {
    n * NANOS_PER_MSEC
}

/// Returns `n` seconds as an [`Interval`].
#[inline]
pub const fn sec(n: i64) -> Interval {
    n * NANOS_PER_SEC
}

/// Wall-clock time in nanoseconds since the Unix epoch.
pub fn epoch_nanos() -> i64 {
    let now = std::time::SystemTime::now();
    let since = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(since.as_nanos()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_helpers() {
        assert_eq!(usec(3), 3_000);
        assert_eq!(msec(10), 10_000_000);
        assert_eq!(sec(2), 2_000_000_000);
    }

    #[test]
    fn test_epoch_nanos_advances() {
        let a = epoch_nanos();
        let b = epoch_nanos();
        assert!(a > 0);
        assert!(b >= a);
    }
}
