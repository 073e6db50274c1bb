//! The heap-allocated atomic counter shared by every owner of a value.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use log::{trace, warn};

use crate::error::SharedError;

/// Counts beyond this are treated as a leak of owners and abort the process.
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// Handle to a separately allocated `AtomicUsize`.
///
/// A `RefCount` is one unit of the count it points at. It is neither `Copy`
/// nor `Clone`: new units are minted with [`RefCount::share`], and a unit is
/// given back with [`RefCount::release`].
pub(crate) struct RefCount {
    ptr: NonNull<AtomicUsize>,
}

unsafe impl Send for RefCount {}
unsafe impl Sync for RefCount {}

impl RefCount {
    fn layout() -> Layout {
        Layout::new::<AtomicUsize>()
    }

    /// Allocates a new counter starting at 1.
    pub(crate) fn try_new() -> Result<RefCount, SharedError> {
        let layout = Self::layout();
        // Safety: AtomicUsize is not zero-sized.
        let raw = unsafe { alloc(layout) } as *mut AtomicUsize;
        let Some(ptr) = NonNull::new(raw) else {
            warn!("failed to allocate reference count ({} bytes)", layout.size());
            return Err(SharedError::alloc_failed(layout));
        };
        // Safety: ptr is freshly allocated with the layout of AtomicUsize.
        unsafe { ptr.as_ptr().write(AtomicUsize::new(1)) };
        trace!("allocated reference count at {:p}", ptr);
        Ok(RefCount { ptr })
    }

    /// Like [`RefCount::try_new`], but diverges through
    /// [`handle_alloc_error`] when the allocator fails.
    pub(crate) fn new() -> RefCount {
        match Self::try_new() {
            Ok(count) => count,
            Err(_) => handle_alloc_error(Self::layout()),
        }
    }

    fn count(&self) -> &AtomicUsize {
        // Safety: the counter stays allocated while any unit of it is live,
        // and self is one.
        unsafe { self.ptr.as_ref() }
    }

    /// Mints another unit of this count.
    pub(crate) fn share(&self) -> RefCount {
        // Relaxed is enough: the new unit is derived from a live one, so the
        // count cannot be at zero concurrently.
        let old = self.count().fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            std::process::abort();
        }
        RefCount { ptr: self.ptr }
    }

    /// Gives back this unit.
    ///
    /// Returns `Some(last)` when this was the final unit. The holder must then
    /// destroy whatever the count protected and hand `last` to
    /// [`LastRef::free`]. All prior uses by other threads happen-before the
    /// return of `Some`.
    pub(crate) fn release(self) -> Option<LastRef> {
        if self.count().fetch_sub(1, Ordering::Release) != 1 {
            return None;
        }
        fence(Ordering::Acquire);
        Some(LastRef { ptr: self.ptr })
    }

    /// Samples the current count.
    pub(crate) fn load(&self) -> usize {
        self.count().load(Ordering::Relaxed)
    }

    /// Whether this is the only unit. Synchronizes with every earlier release
    /// when it returns true.
    pub(crate) fn is_unique(&self) -> bool {
        if self.count().load(Ordering::Relaxed) == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    pub(crate) fn same(&self, other: &RefCount) -> bool {
        self.ptr == other.ptr
    }
}

/// A counter whose count has reached zero. Nothing else can observe it.
#[must_use = "the counter leaks unless freed"]
pub(crate) struct LastRef {
    ptr: NonNull<AtomicUsize>,
}

impl LastRef {
    pub(crate) fn free(self) {
        trace!("freeing reference count at {:p}", self.ptr);
        // Safety: the count reached zero, so no RefCount points here anymore,
        // and the memory came from `alloc` with the same layout.
        unsafe { dealloc(self.ptr.as_ptr() as *mut u8, RefCount::layout()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one() {
        let count = RefCount::new();
        assert_eq!(count.load(), 1);
        assert!(count.is_unique());
        count.release().expect("sole unit is the last").free();
    }

    #[test]
    fn share_and_release() {
        let a = RefCount::new();
        let b = a.share();
        assert!(a.same(&b));
        assert_eq!(a.load(), 2);
        assert!(!b.is_unique());

        assert!(b.release().is_none());
        assert_eq!(a.load(), 1);
        a.release().expect("last unit").free();
    }

    #[test]
    fn distinct_counters_differ() {
        let a = RefCount::new();
        let b = RefCount::new();
        assert!(!a.same(&b));
        a.release().unwrap().free();
        b.release().unwrap().free();
    }

    #[test]
    fn exactly_one_thread_sees_last() {
        for _ in 0..64 {
            let root = RefCount::new();
            let mut units: Vec<RefCount> = (0..7).map(|_| root.share()).collect();
            units.push(root);
            let lasts = std::thread::scope(|scope| {
                let handles: Vec<_> = units
                    .into_iter()
                    .map(|unit| {
                        scope.spawn(move || match unit.release() {
                            Some(last) => {
                                last.free();
                                1
                            }
                            None => 0,
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap())
                    .sum::<usize>()
            });
            assert_eq!(lasts, 1);
        }
    }
}
