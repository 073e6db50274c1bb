use std::alloc::{alloc, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr::{self, NonNull};

use log::{trace, warn};

use crate::count::RefCount;
use crate::error::SharedError;

/// A value together with the unit of its shared count held by one owner.
struct Owned<T> {
    value: NonNull<T>,
    count: RefCount,
}

/// Shared ownership of a heap-allocated `T`, counted by a separately
/// allocated atomic counter.
///
/// Cloning adds an owner, dropping or [`reset`](SharedPtr::reset) removes one,
/// and the owner that brings the count to zero frees both the value and the
/// counter. A `SharedPtr` may also be empty, holding neither.
///
/// Dereferencing an empty `SharedPtr` panics; use [`get`](SharedPtr::get) or
/// [`try_get`](SharedPtr::try_get) for checked access. The pointer keeps the
/// value alive but does not synchronize access to it.
///
/// Accessors whose names could collide with methods of `T` are associated
/// functions, called as `SharedPtr::get(&p)`.
pub struct SharedPtr<T> {
    owned: Option<Owned<T>>,
    _marker: PhantomData<T>,
}

unsafe impl<T> Send for SharedPtr<T> where T: Send + Sync {}
unsafe impl<T> Sync for SharedPtr<T> where T: Send + Sync {}

/// Moves `value` into a `Box`, reporting allocator failure instead of
/// aborting.
fn try_box<T>(value: T) -> Result<Box<T>, SharedError> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Ok(Box::new(value));
    }
    // Safety: layout is not zero-sized.
    let raw = unsafe { alloc(layout) } as *mut T;
    let Some(ptr) = NonNull::new(raw) else {
        warn!("failed to allocate shared value ({} bytes)", layout.size());
        return Err(SharedError::alloc_failed(layout));
    };
    // Safety: ptr came from the global allocator with T's layout, which is
    // exactly what Box expects to free.
    unsafe {
        ptr.as_ptr().write(value);
        Ok(Box::from_raw(ptr.as_ptr()))
    }
}

impl<T> SharedPtr<T> {
    /// An empty pointer. Allocates nothing.
    pub const fn empty() -> SharedPtr<T> {
        SharedPtr {
            owned: None,
            _marker: PhantomData,
        }
    }

    fn owning(value: NonNull<T>, count: RefCount) -> SharedPtr<T> {
        SharedPtr {
            owned: Some(Owned { value, count }),
            _marker: PhantomData,
        }
    }

    /// Moves `value` to the heap as the first owner.
    pub fn new(value: T) -> SharedPtr<T> {
        Self::from_box(Box::new(value))
    }

    /// Like [`SharedPtr::new`], but reports allocator failure.
    pub fn try_new(value: T) -> Result<SharedPtr<T>, SharedError> {
        Self::try_from_box(try_box(value)?)
    }

    /// Takes ownership of an already boxed value.
    pub fn from_box(value: Box<T>) -> SharedPtr<T> {
        Self::owning(NonNull::from(Box::leak(value)), RefCount::new())
    }

    /// Like [`SharedPtr::from_box`], but reports allocator failure. The value
    /// is dropped if the counter cannot be allocated.
    pub fn try_from_box(value: Box<T>) -> Result<SharedPtr<T>, SharedError> {
        // Safety: Box::into_raw yields an owning pointer from the global
        // allocator.
        unsafe { Self::from_raw(Box::into_raw(value)) }
    }

    /// Takes ownership of a raw pointer. A null pointer yields an empty
    /// instance and no counter is kept.
    ///
    /// # Errors
    ///
    /// [`SharedError::AllocFailed`] if the counter cannot be allocated; the
    /// pointee is dropped and freed in that case.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or come from [`Box::into_raw`], and nothing else may
    /// own it.
    pub unsafe fn from_raw(ptr: *mut T) -> Result<SharedPtr<T>, SharedError> {
        let Some(value) = NonNull::new(ptr) else {
            return Ok(Self::empty());
        };
        match RefCount::try_new() {
            Ok(count) => Ok(Self::owning(value, count)),
            Err(err) => {
                drop(Box::from_raw(ptr));
                Err(err)
            }
        }
    }

    /// Whether this instance owns a value.
    pub fn is_some(this: &Self) -> bool {
        this.owned.is_some()
    }

    /// Whether this instance owns nothing.
    pub fn is_empty(this: &Self) -> bool {
        this.owned.is_none()
    }

    /// The owned value, or `None` when empty.
    pub fn get(this: &Self) -> Option<&T> {
        // Safety: the value stays allocated while this owner is live.
        this.owned.as_ref().map(|owned| unsafe { owned.value.as_ref() })
    }

    /// The owned value, or [`SharedError::NullDereference`] when empty.
    pub fn try_get(&self) -> Result<&T, SharedError> {
        Self::get(self).ok_or(SharedError::NullDereference)
    }

    /// Non-owning pointer to the value, null when empty.
    pub fn as_ptr(this: &Self) -> *const T {
        this.owned
            .as_ref()
            .map_or(ptr::null(), |owned| owned.value.as_ptr() as *const T)
    }

    /// Number of owners of the value, 0 when empty.
    ///
    /// Other threads may change the count at any time, so the result is only
    /// a sample.
    pub fn use_count(&self) -> usize {
        self.owned.as_ref().map_or(0, |owned| owned.count.load())
    }

    /// Whether both instances own the same value, or are both empty.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        match (&this.owned, &other.owned) {
            (None, None) => true,
            (Some(a), Some(b)) => a.count.same(&b.count),
            _ => false,
        }
    }

    /// Mutable access when this is the only owner.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        let owned = this.owned.as_mut()?;
        if owned.count.is_unique() {
            // Safety: this pointer is mutably borrowed and is the only owner,
            // so nothing else can reach the value.
            Some(unsafe { owned.value.as_mut() })
        } else {
            None
        }
    }

    /// Gives up this owner. Returns the value if this was the last owner.
    pub fn into_inner(mut this: Self) -> Option<T> {
        let owned = this.owned.take()?;
        let last = owned.count.release()?;
        last.free();
        // Safety: the count reached zero, so this was the last owner, and the
        // value came from a Box.
        let value = unsafe { Box::from_raw(owned.value.as_ptr()) };
        Some(*value)
    }

    /// Releases ownership and leaves this instance empty. Frees the value and
    /// the counter if this was the last owner.
    pub fn reset(&mut self) {
        let Some(owned) = self.owned.take() else {
            return;
        };
        let Some(last) = owned.count.release() else {
            return;
        };
        trace!("last owner released shared value at {:p}", owned.value);
        last.free();
        // Safety: the count reached zero, so no other owner can reach the
        // value, and it came from a Box.
        unsafe { drop(Box::from_raw(owned.value.as_ptr())) };
    }

    /// Releases ownership, then owns `value` with a fresh count of 1.
    pub fn reset_with(&mut self, value: T) {
        *self = Self::new(value);
    }

    /// Like [`SharedPtr::reset_with`], but reports allocator failure. On
    /// failure this instance is left unchanged.
    pub fn try_reset_with(&mut self, value: T) -> Result<(), SharedError> {
        *self = Self::try_new(value)?;
        Ok(())
    }

    /// Releases ownership, then takes ownership of `ptr` as
    /// [`SharedPtr::from_raw`] does.
    ///
    /// # Errors
    ///
    /// [`SharedError::AllocFailed`] if the counter cannot be allocated. This
    /// instance is left unchanged and the pointee is freed.
    ///
    /// # Safety
    ///
    /// Same contract as [`SharedPtr::from_raw`].
    pub unsafe fn reset_raw(&mut self, ptr: *mut T) -> Result<(), SharedError> {
        *self = Self::from_raw(ptr)?;
        Ok(())
    }

    /// Exchanges what the two instances own. The counts are untouched.
    pub fn swap(this: &mut Self, other: &mut Self) {
        mem::swap(&mut this.owned, &mut other.owned);
    }

    /// Moves ownership out, leaving this instance empty. The count is
    /// untouched.
    pub fn take(this: &mut Self) -> SharedPtr<T> {
        mem::take(this)
    }

    /// Move-assignment: releases what this instance owns and takes over what
    /// `source` owns, leaving `source` empty. A no-op when both already own
    /// the same value.
    pub fn assign_from(&mut self, source: &mut Self) {
        if Self::ptr_eq(self, source) {
            return;
        }
        self.reset();
        Self::swap(self, source);
    }
}

impl<T> Clone for SharedPtr<T> {
    fn clone(&self) -> SharedPtr<T> {
        match &self.owned {
            Some(owned) => Self::owning(owned.value, owned.count.share()),
            None => Self::empty(),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if Self::ptr_eq(self, source) {
            return;
        }
        *self = source.clone();
    }
}

impl<T> Drop for SharedPtr<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T> Deref for SharedPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match Self::get(self) {
            Some(value) => value,
            None => panic!("{}", SharedError::NullDereference),
        }
    }
}

impl<T> Default for SharedPtr<T> {
    fn default() -> SharedPtr<T> {
        Self::empty()
    }
}

impl<T> From<Box<T>> for SharedPtr<T> {
    fn from(value: Box<T>) -> SharedPtr<T> {
        Self::from_box(value)
    }
}

impl<T> From<T> for SharedPtr<T> {
    fn from(value: T) -> SharedPtr<T> {
        Self::new(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Self::get(self) {
            Some(value) => f
                .debug_struct("SharedPtr")
                .field("value", value)
                .field("use_count", &self.use_count())
                .finish(),
            None => f.write_str("SharedPtr(Empty)"),
        }
    }
}

impl<T> fmt::Pointer for SharedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&Self::as_ptr(self), f)
    }
}
