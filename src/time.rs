//! Time APIs for obtaining the current time and calculating with points in time and durations.
//!
//! These APIs are made for the mesh stack and are not meant to be general-purpose. They have
//! millisecond resolution and use 32-bit arithmetic throughout: an [`Instant`] wraps around after
//! about 49 days, and all comparisons use the signed difference between two raw values, so a wrap
//! is tolerated without special cases as long as compared instants are less than ~24 days apart.

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// A duration with millisecond resolution.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(u32);

impl Duration {
    /// A zero-length duration.
    pub const ZERO: Self = Duration(0);

    /// Creates a `Duration` from a number of milliseconds.
    pub const fn from_millis(millis: u32) -> Self {
        Duration(millis)
    }

    /// Creates a `Duration` representing the given number of seconds.
    pub const fn from_secs(secs: u16) -> Self {
        Duration(secs as u32 * 1_000)
    }

    /// Returns the number of milliseconds represented by `self`.
    pub fn as_millis(&self) -> u32 {
        self.0
    }

    /// Returns the number of whole seconds that fit in `self`.
    pub fn whole_secs(&self) -> u32 {
        self.0 / 1_000
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Duration(self.0.checked_add(rhs.0).expect("duration overflow"))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Duration(self.0.checked_sub(rhs.0).expect("duration underflow"))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1000 {
            let (secs, submilli) = (self.whole_secs(), self.0 % 1000);
            if submilli == 0 {
                write!(f, "{}s", secs)
            } else {
                write!(f, "{}.{:03}s", secs, submilli)
            }
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// A point in time, relative to an unspecified epoch.
///
/// This has millisecond resolution and wraps around after about 49 days. Apart from the
/// wraparound, it is monotonic.
///
/// `Instant`s are obtained from an implementation of [`MillisecondClock`]. `Instant`s created from
/// different clock instances are not compatible, and mixing them in operations causes unspecified
/// results.
///
/// [`MillisecondClock`]: trait.MillisecondClock.html
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct Instant(u32);

impl Instant {
    /// Creates an `Instant` from raw milliseconds since an arbitrary implementation-defined
    /// reference point.
    ///
    /// This should only be called from a [`MillisecondClock`] implementation.
    ///
    /// [`MillisecondClock`]: trait.MillisecondClock.html
    pub const fn from_raw_millis(millis: u32) -> Self {
        Instant(millis)
    }

    /// Returns the raw value from which this `Instant` was created.
    pub fn raw_millis(&self) -> u32 {
        self.0
    }

    /// Returns whether `self` lies strictly after `deadline`.
    ///
    /// Two's-complement arithmetic handles the case where the raw millisecond counter has wrapped
    /// back to zero between the two instants, as long as they are less than half the counter range
    /// apart.
    pub fn has_passed(&self, deadline: Instant) -> bool {
        self.0.wrapping_sub(deadline.0) as i32 > 0
    }

    /// Calculates the duration of time that has passed between `earlier` and `self`.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.wrapping_sub(earlier.0))
    }
}

/// [`Instant`]s can be subtracted, which computes the [`Duration`] between the rhs and lhs using
/// [`Instant::duration_since`].
impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.duration_since(rhs)
    }
}

/// A [`Duration`] can be added to an [`Instant`], moving the [`Instant`] forwards in time.
impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, d: Duration) -> Self {
        Instant(self.0.wrapping_add(d.as_millis()))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// Trait for monotonic time providers.
///
/// The hardware interface has to provide an implementation of `MillisecondClock` to the stack.
/// This trait can also be implemented by a mock clock for testing.
pub trait MillisecondClock {
    /// Obtain the current time as an [`Instant`].
    ///
    /// The values returned by this function must never move backwards in time, except when the
    /// underlying 32-bit millisecond counter wraps around.
    ///
    /// [`Instant`]: struct.Instant.html
    fn now(&self) -> Instant;
}

/// Trait for wall-clock ("real time clock") providers.
///
/// The mesh uses this clock to timestamp outgoing encrypted payloads and advertisements. It may be
/// volatile (reset to an arbitrary value at boot) or battery-backed; the stack does not care, but
/// replay protection on the receiving side only works when the clock moves forward between
/// messages from the same sender.
pub trait RtcClock {
    /// Returns the current time in seconds since the Unix epoch.
    fn current_time(&self) -> u32;

    /// Adjusts the clock, eg. from a time reference received over the air or from a UI.
    fn set_current_time(&mut self, secs: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_passed_simple() {
        let t0 = Instant::from_raw_millis(1000);
        let now = Instant::from_raw_millis(1001);
        assert!(now.has_passed(t0));
        assert!(!t0.has_passed(now));
        assert!(!t0.has_passed(t0));
    }

    #[test]
    fn has_passed_across_wrap() {
        let before_wrap = Instant::from_raw_millis(u32::MAX - 10);
        let after_wrap = Instant::from_raw_millis(5);
        assert!(after_wrap.has_passed(before_wrap));
        assert!(!before_wrap.has_passed(after_wrap));
        assert_eq!(
            after_wrap.duration_since(before_wrap),
            Duration::from_millis(16)
        );
    }

    #[test]
    fn add_wraps() {
        let t = Instant::from_raw_millis(u32::MAX) + Duration::from_millis(2);
        assert_eq!(t.raw_millis(), 1);
    }
}
