use std::{
    cmp::Ordering,
    fmt::{Display, Formatter, Result},
    marker::PhantomData,
    ops::{Add, AddAssign, Sub, SubAssign},
};

/// Useful alias for "pointer to an untyped byte in the tracee".
pub type Void = u8;

/// A typed pointer into the address space of a traced process. Arithmetic
/// is scaled by `size_of::<T>()`, like a raw pointer, but the address is
/// never dereferenceable in this process.
///
/// Manually derive Copy, Clone due to quirks with PhantomData.
#[derive(Hash, Debug)]
pub struct RemotePtr<T> {
    ptr: usize,
    /// This struct does not own a `T`; it is a kind of pointer to one, so
    /// per the PhantomData docs we carry `PhantomData<*const T>`.
    phantom: PhantomData<*const T>,
}

impl<T> RemotePtr<T> {
    pub fn null() -> RemotePtr<T> {
        RemotePtr {
            ptr: 0,
            phantom: PhantomData,
        }
    }

    pub fn new_from_val(val: usize) -> RemotePtr<T> {
        RemotePtr {
            ptr: val,
            phantom: PhantomData,
        }
    }

    pub fn as_usize(&self) -> usize {
        self.ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }

    pub fn referent_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    pub fn cast<U>(r: RemotePtr<U>) -> RemotePtr<T> {
        RemotePtr::<T>::new_from_val(r.ptr)
    }

    pub fn as_rptr_u8(self) -> RemotePtr<u8> {
        RemotePtr::<u8>::new_from_val(self.ptr)
    }
}

// The PhantomData<*const T> is only a variance/ownership marker; a
// RemotePtr is just an address in another process and is never
// dereferenced here, so it is safe to move and share across threads.
unsafe impl<T> Send for RemotePtr<T> {}
unsafe impl<T> Sync for RemotePtr<T> {}

impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        RemotePtr {
            ptr: self.ptr,
            phantom: PhantomData,
        }
    }
}

impl<T> Copy for RemotePtr<T> {}

impl<T> Default for RemotePtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Display for RemotePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl<T> Add<usize> for RemotePtr<T> {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        // Overflow panics in debug mode; no separate assert needed.
        Self::new_from_val(self.ptr + delta * std::mem::size_of::<T>())
    }
}

impl<T> Sub<usize> for RemotePtr<T> {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        Self::new_from_val(self.ptr - delta * std::mem::size_of::<T>())
    }
}

/// Element distance. Note that the other RemotePtr must have the SAME
/// referent type.
impl<T> Sub<RemotePtr<T>> for RemotePtr<T> {
    type Output = usize;

    fn sub(self, rhs: RemotePtr<T>) -> Self::Output {
        (self.ptr - rhs.ptr) / std::mem::size_of::<T>()
    }
}

impl<T> AddAssign<usize> for RemotePtr<T> {
    fn add_assign(&mut self, rhs: usize) {
        self.ptr += rhs * std::mem::size_of::<T>();
    }
}

impl<T> SubAssign<usize> for RemotePtr<T> {
    fn sub_assign(&mut self, rhs: usize) {
        self.ptr -= rhs * std::mem::size_of::<T>();
    }
}

impl<T> PartialOrd for RemotePtr<T> {
    fn partial_cmp(&self, other: &RemotePtr<T>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for RemotePtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ptr.cmp(&other.ptr)
    }
}

impl<T> PartialEq for RemotePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for RemotePtr<T> {}

impl<T> From<usize> for RemotePtr<T> {
    fn from(addr: usize) -> Self {
        RemotePtr::<T>::new_from_val(addr)
    }
}

impl<T> From<RemotePtr<T>> for usize {
    fn from(p: RemotePtr<T>) -> usize {
        p.as_usize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_zero() {
        let a = RemotePtr::<u64>::null();
        assert_eq!(0, a.as_usize());
        assert!(a.is_null());
    }

    #[test]
    fn arithmetic_scales_by_referent() {
        struct S(u64, u64);
        let a = RemotePtr::<S>::null();
        let b = a + 1usize;
        assert_eq!(16, b.as_usize());
        assert_eq!(0, (b - 1usize).as_usize());
        assert_eq!(1, b - a);
    }

    #[test]
    fn cast_changes_referent_only() {
        struct S(u64, u64);
        let a = RemotePtr::<u64>::new_from_val(8);
        let b = RemotePtr::<S>::cast(a);
        assert_eq!(8, b.as_usize());
        assert_eq!(16, b.referent_size());
    }

    #[test]
    fn ordering() {
        let c = RemotePtr::<u8>::new_from_val(0);
        let d = RemotePtr::<u8>::new_from_val(16);
        assert!(c < d);
        assert_ne!(c, d);
        assert_eq!(c, c.clone());
    }
}
