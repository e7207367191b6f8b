use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

const TAG_SHIFT: u32 = 48;
const ADDR_MASK: u64 = (1u64 << TAG_SHIFT) - 1;

/// A pointer paired with a generation counter, packed into a single word.
///
/// The low 48 bits hold the address and the high 16 bits hold the counter, so
/// both halves can be compared and swapped as one atomic unit. Two tagged
/// pointers are equal only if address and counter both match, even when an
/// address has been freed and handed out again by the allocator.
pub struct TaggedPtr<T> {
    raw: u64,
    _marker: PhantomData<*mut T>,
}

impl<T> TaggedPtr<T> {
    pub fn null() -> Self {
        TaggedPtr {
            raw: 0,
            _marker: PhantomData,
        }
    }

    pub fn from_parts(ptr: *mut T, tag: u16) -> Self {
        let addr = ptr as u64;
        debug_assert!((addr & !ADDR_MASK) == 0);
        TaggedPtr {
            raw: (u64::from(tag) << TAG_SHIFT) | addr,
            _marker: PhantomData,
        }
    }

    pub fn ptr(&self) -> *mut T {
        (self.raw & ADDR_MASK) as *mut T
    }

    pub fn tag(&self) -> u16 {
        (self.raw >> TAG_SHIFT) as u16
    }

    pub fn is_null(&self) -> bool {
        self.raw & ADDR_MASK == 0
    }
}

impl<T> Clone for TaggedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TaggedPtr<T> {}

impl<T> PartialEq for TaggedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for TaggedPtr<T> {}

impl<T> fmt::Debug for TaggedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TaggedPtr {{ ptr: {:?}, tag: {} }}", self.ptr(), self.tag())
    }
}

/// An atomic word holding a `TaggedPtr`.
///
/// Every successful `compare_exchange` installs the new address with the
/// counter incremented, so a CAS whose expected value was read before the
/// slot was rewritten fails even if the raw address happens to match again.
pub struct AtomicTaggedPtr<T> {
    inner: AtomicU64,
    _marker: PhantomData<*mut T>,
}

// The atomic word itself is freely shareable, like std's AtomicPtr; access
// to the pointed-to data is the caller's responsibility.
unsafe impl<T> Send for AtomicTaggedPtr<T> {}
unsafe impl<T> Sync for AtomicTaggedPtr<T> {}

impl<T> AtomicTaggedPtr<T> {
    pub fn new(ptr: *mut T) -> Self {
        AtomicTaggedPtr {
            inner: AtomicU64::new(TaggedPtr::from_parts(ptr, 0).raw),
            _marker: PhantomData,
        }
    }

    pub fn load(&self, order: Ordering) -> TaggedPtr<T> {
        TaggedPtr {
            raw: self.inner.load(order),
            _marker: PhantomData,
        }
    }

    /// Attempt to replace `current` with `new`, bumping the generation.
    ///
    /// The compare half matches on address and counter together; the swap
    /// half stores `new` tagged with `current.tag() + 1`.
    pub fn compare_exchange(
        &self,
        current: TaggedPtr<T>,
        new: *mut T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedPtr<T>, TaggedPtr<T>> {
        let next = TaggedPtr::from_parts(new, current.tag().wrapping_add(1));
        match self
            .inner
            .compare_exchange(current.raw, next.raw, success, failure)
        {
            Ok(_) => Ok(next),
            Err(raw) => Err(TaggedPtr {
                raw,
                _marker: PhantomData,
            }),
        }
    }
}

impl<T> Default for AtomicTaggedPtr<T> {
    fn default() -> Self {
        AtomicTaggedPtr {
            inner: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for AtomicTaggedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AtomicTaggedPtr {{ {:?} }}", self.load(Ordering::Relaxed))
    }
}
