// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Virtual time, as seen by the APIC timer.

use std::time::Duration;

/// A point in virtual time, in nanoseconds since VM boot (or some other
/// origin).
///
/// Comparisons are wrapping so that the APIC timer keeps working if the clock
/// origin is close to `u64::MAX`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct VmTime(u64);

impl VmTime {
    /// Converts from a time in nanoseconds.
    pub const fn from_nanos(n: u64) -> Self {
        Self(n)
    }

    /// Gets the time in nanoseconds.
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Adds `d` to the time.
    pub fn wrapping_add(self, d: Duration) -> Self {
        Self((self.0 as u128).wrapping_add(d.as_nanos()) as u64)
    }

    /// Returns whether `self` is before `t`.
    ///
    /// Note that this is a relative comparison in the 64-bit space and is not
    /// transitive.
    pub fn is_before(self, t: Self) -> bool {
        let delta = self.0.wrapping_sub(t.0);
        (delta as i64) < 0
    }

    /// Returns whether `self` is after `t`.
    ///
    /// See the comment about transitivity in [`Self::is_before`].
    pub fn is_after(self, t: Self) -> bool {
        let delta = self.0.wrapping_sub(t.0);
        (delta as i64) > 0
    }

    /// Returns the time between `self` and `t`, returning `None` if `self` is
    /// before `t`.
    pub fn checked_sub(self, t: Self) -> Option<Duration> {
        let delta = self.0.wrapping_sub(t.0);
        if (delta as i64) >= 0 {
            Some(Duration::from_nanos(delta))
        } else {
            None
        }
    }
}
