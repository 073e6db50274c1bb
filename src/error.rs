//! Errors reported by [`SharedPtr`](crate::SharedPtr).

use std::alloc::Layout;
use std::error::Error;
use std::fmt;

/// Errors that can occur while constructing, resetting or accessing a
/// [`SharedPtr`](crate::SharedPtr).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SharedError {
    /// The allocator returned null for the value or its counter.
    AllocFailed {
        /// Size in bytes of the failed request.
        size: usize,
        /// Alignment of the failed request.
        align: usize,
    },
    /// Checked access to an empty instance.
    NullDereference,
}

impl SharedError {
    pub(crate) fn alloc_failed(layout: Layout) -> Self {
        Self::AllocFailed {
            size: layout.size(),
            align: layout.align(),
        }
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocFailed { size, align } => {
                write!(f, "allocation failed: {size} bytes aligned to {align}")
            }
            Self::NullDereference => write!(f, "dereferenced an empty shared pointer"),
        }
    }
}

impl Error for SharedError {}
