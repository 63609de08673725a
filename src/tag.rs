//! Logical time tags.
//!
//! A [`Tag`] is a superdense timestamp: an instant plus a microstep. Tags are
//! totally ordered, time first and microstep second, which is exactly the
//! field order used by the derived `Ord`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Instant, Interval, Microstep, NANOS_PER_MSEC, NANOS_PER_USEC};

/// A logical timestamp `(time, microstep)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    /// Nanoseconds since start.
    pub time: Instant,
    /// Microstep within `time`.
    pub microstep: Microstep,
}

impl Tag {
    /// A tag earlier than any tag that can be processed.
    pub const NEVER: Tag = Tag { time: i64::MIN, microstep: 0 };

    /// A tag later than any tag that can be processed.
    pub const FOREVER: Tag = Tag { time: i64::MAX, microstep: u32::MAX };

    /// The start tag of every execution.
    pub const ZERO: Tag = Tag { time: 0, microstep: 0 };

    /// Creates a tag.
    #[inline]
    pub const fn new(time: Instant, microstep: Microstep) -> Self {
        Self { time, microstep }
    }

    /// Creates a tag at microstep zero.
    #[inline]
    pub const fn at(time: Instant) -> Self {
        Self { time, microstep: 0 }
    }

    #[inline]
    pub fn is_never(self) -> bool {
        self == Tag::NEVER
    }

    #[inline]
    pub fn is_forever(self) -> bool {
        self == Tag::FOREVER
    }

    /// The tag one microstep later. `NEVER` and `FOREVER` are fixed points.
    pub fn next_microstep(self) -> Tag {
        if self.is_never() || self.is_forever() {
            return self;
        }
        match self.microstep.checked_add(1) {
            Some(microstep) => Tag { time: self.time, microstep },
            None => Tag::at(self.time.saturating_add(1)),
        }
    }

    /// The tag at which something produced at `self` arrives through a
    /// connection with the given delay.
    ///
    /// * `None`: same tag (instantaneous connection)
    /// * `Some(0)`: next microstep
    /// * `Some(d)`: `(time + d, 0)`
    pub fn delayed(self, delay: Option<Interval>) -> Tag {
        match delay {
            None => self,
            Some(d) => self.after(d),
        }
    }

    /// The tag `d` nanoseconds after `self`; a zero interval advances the
    /// microstep instead.
    pub fn after(self, d: Interval) -> Tag {
        if self.is_never() || self.is_forever() {
            return self;
        }
        if d == 0 {
            return self.next_microstep();
        }
        match self.time.checked_add(d) {
            Some(time) if time < i64::MAX => Tag::at(time),
            _ => Tag::FOREVER,
        }
    }
}

impl Default for Tag {
    fn default() -> Self {
        Tag::ZERO
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return write!(f, "(NEVER)");
        }
        if self.is_forever() {
            return write!(f, "(FOREVER)");
        }
        if self.time % NANOS_PER_MSEC == 0 {
            write!(f, "({} ms, {})", self.time / NANOS_PER_MSEC, self.microstep)
        } else if self.time % NANOS_PER_USEC == 0 {
            write!(f, "({} us, {})", self.time / NANOS_PER_USEC, self.microstep)
        } else {
            write!(f, "({} ns, {})", self.time, self.microstep)
        }
    }
}
