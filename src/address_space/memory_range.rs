use crate::remote_ptr::{RemotePtr, Void};
use std::cmp::{max, min};
use std::fmt::{Display, Formatter, Result};

/// A half-open range of tracee addresses. The end point is NOT included.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct MemoryRange {
    start_: RemotePtr<Void>,
    end_: RemotePtr<Void>,
}

impl MemoryRange {
    pub fn new_range(addr: RemotePtr<Void>, num_bytes: usize) -> MemoryRange {
        // If the addition overflows, rust panics in debug mode. So no
        // need for debug_assert!(result.start_ <= result.end_).
        MemoryRange {
            start_: addr,
            end_: addr + num_bytes,
        }
    }

    pub fn from_range(addr: RemotePtr<Void>, end: RemotePtr<Void>) -> MemoryRange {
        let result = MemoryRange {
            start_: addr,
            end_: end,
        };
        debug_assert!(result.start_ <= result.end_);
        result
    }

    /// Return true iff `other` is an address range fully contained by
    /// self.
    pub fn contains(&self, other: &Self) -> bool {
        self.start_ <= other.start_ && other.end_ <= self.end_
    }

    pub fn contains_ptr(&self, p: RemotePtr<Void>) -> bool {
        self.start_ <= p && p < self.end_
    }

    pub fn intersects(&self, other: &MemoryRange) -> bool {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        s < e
    }

    pub fn start(&self) -> RemotePtr<Void> {
        self.start_
    }
    pub fn end(&self) -> RemotePtr<Void> {
        self.end_
    }
    pub fn size(&self) -> usize {
        self.end_ - self.start_
    }
}

impl Display for MemoryRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}-{}", self.start_, self.end_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: usize, size: usize) -> MemoryRange {
        MemoryRange::new_range(start.into(), size)
    }

    #[test]
    fn contains_ptr_is_half_open() {
        let r = range(0x1000, 0x1000);
        assert!(r.contains_ptr(0x1000.into()));
        assert!(r.contains_ptr(0x1fff.into()));
        assert!(!r.contains_ptr(0x2000.into()));
        assert!(!r.contains_ptr(0xfff.into()));
    }

    #[test]
    fn containment_and_intersection() {
        let outer = range(0x1000, 0x3000);
        let inner = range(0x2000, 0x1000);
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(outer.intersects(&inner));
        // Abutting ranges do not intersect.
        assert!(!range(0x1000, 0x1000).intersects(&range(0x2000, 0x1000)));
    }
}
