//! Upstream memory resources that arenas are carved from.

use core::{alloc::Layout, ptr::NonNull};

/// A source of raw memory for an arena.
///
/// An allocator asks its upstream resource for its whole arena once, at
/// construction, and hands it back when dropped.
pub trait MemoryResource {
    /// Allocates a block of memory described by `layout`.
    ///
    /// Returns `None` if the resource cannot satisfy the request.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Releases a block previously returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on a resource that
    /// [`is_equal`](Self::is_equal) to this one, with the same `layout`, and
    /// must not have been released since.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    /// Whether memory allocated from `other` may be released through `self`.
    fn is_equal(&self, other: &Self) -> bool;
}

/// The process-wide allocator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Global;

impl MemoryResource for Global {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        NonNull::new(unsafe { alloc::alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) }
    }

    fn is_equal(&self, _other: &Self) -> bool {
        true
    }
}

impl<T> MemoryResource for &T
where
    T: MemoryResource,
{
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { (**self).deallocate(ptr, layout) }
    }

    fn is_equal(&self, other: &Self) -> bool {
        (**self).is_equal(*other)
    }
}
