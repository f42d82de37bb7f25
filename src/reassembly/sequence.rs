//! Wraparound-aware TCP sequence numbers.
//!
//! Sequence numbers live in a circular 32-bit space. Two values are compared
//! by taking their difference modulo 2^32 and reading it as a signed 32-bit
//! integer, so ordering is only meaningful while both values sit within half
//! the number space of each other.
//!
//! Reference: RFC 793 section 3.3, RFC 1982 (serial number arithmetic).

use std::fmt;

/// Half of the sequence space. Two live values further apart than this
/// cannot be ordered.
pub const HALF_SPACE: u64 = 1 << 31;

/// A 32-bit TCP sequence number with modular ordering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sequence(pub u32);

impl Sequence {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Signed distance from `other` to `self`: positive when `self` is ahead.
    pub fn difference(self, other: Sequence) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// True when `self` strictly precedes `other`.
    pub fn less_than(self, other: Sequence) -> bool {
        self.difference(other) < 0
    }

    pub fn add(self, n: usize) -> Sequence {
        Sequence(self.0.wrapping_add(n as u32))
    }

    /// True when a range of `len` bytes starting at `self` can still be
    /// ordered against `base`: it starts less than half the number space
    /// behind `base` and ends less than half the number space ahead of it.
    pub fn within_window(self, base: Sequence, len: usize) -> bool {
        let diff = self.difference(base) as i64;
        diff > -(HALF_SPACE as i64) && diff + (len as i64) < HALF_SPACE as i64
    }
}

impl From<u32> for Sequence {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difference_across_wrap() {
        let before = Sequence(0xFFFF_FFF0);
        let after = Sequence(0x0000_0010);
        assert_eq!(after.difference(before), 0x20);
        assert_eq!(before.difference(after), -0x20);
        assert!(before.less_than(after));
        assert!(!after.less_than(before));
    }

    #[test]
    fn test_add_wraps() {
        let s = Sequence(0xFFFF_FFF0).add(16);
        assert_eq!(s, Sequence(0));
        assert_eq!(Sequence(0xFFFF_FFF0).add(0x20), Sequence(0x10));
    }

    #[test]
    fn test_equal_values_are_not_less() {
        let s = Sequence(42);
        assert_eq!(s.difference(s), 0);
        assert!(!s.less_than(s));
    }

    #[test]
    fn test_window_bound() {
        let base = Sequence(1000);
        assert!(base.add(10).within_window(base, 100));
        assert!(!base.add((HALF_SPACE - 50) as usize).within_window(base, 100));
        assert!(Sequence(900).within_window(base, 50));
        // exactly half the space apart is ambiguous
        assert!(!base.add(HALF_SPACE as usize).within_window(base, 0));
    }
}
