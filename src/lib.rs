//! Shared ownership of a heap value through an atomically counted pointer.
//!
//! [`SharedPtr<T>`] pairs a pointer to a heap-allocated `T` with a separately
//! allocated `AtomicUsize` counting the instances that point at it. Cloning
//! increments the count, moving leaves it alone, and whichever owner drops the
//! count to zero frees both allocations, from any thread.
//!
//! ```
//! use std::sync::Mutex;
//!
//! use shared_owner::SharedPtr;
//!
//! let v = SharedPtr::new(Mutex::new(vec![]));
//!
//! std::thread::scope(|scope| {
//!     let first = v.clone();
//!     scope.spawn(move || {
//!         first.lock().unwrap().push(42);
//!     });
//!
//!     let second = v.clone();
//!     scope.spawn(move || {
//!         second.lock().unwrap().push(17);
//!     });
//! });
//!
//! assert_eq!(v.use_count(), 1);
//! assert!(v.lock().unwrap().contains(&17));
//! assert!(v.lock().unwrap().contains(&42));
//! ```
//!
//! Reference cycles are never collected; callers must avoid them.

mod count;
pub mod error;
mod shared;

pub use error::SharedError;
pub use shared::SharedPtr;
