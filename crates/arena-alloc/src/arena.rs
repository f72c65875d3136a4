//! Owned, offset-addressed arena buffer.
//!
//! Allocators never reinterpret payload pointers as headers. Every header
//! access goes through [`Arena::read`] and [`Arena::write`], which take a
//! logical offset, bounds-check it, and view exactly the header bytes through
//! a [`DataView`]. Callers' payload bytes are never borrowed by the allocator.

use core::{alloc::Layout, ptr::NonNull, slice};

use dataview::{DataView, Pod};
use snafu::OptionExt as _;

use crate::{
    error::{AllocError, ConfigurationReason, ConfigurationSnafu, OutOfMemorySnafu},
    resource::MemoryResource,
};

/// Alignment of every arena, and of every payload pointer handed out.
pub const ARENA_ALIGN: usize = 16;

pub(crate) struct Arena<U>
where
    U: MemoryResource,
{
    base: NonNull<u8>,
    layout: Layout,
    upstream: U,
}

unsafe impl<U> Send for Arena<U> where U: MemoryResource + Send {}

impl<U> Arena<U>
where
    U: MemoryResource,
{
    /// Acquires a zero-filled arena of `size` bytes from `upstream`.
    pub(crate) fn new(upstream: U, size: usize) -> Result<Self, AllocError> {
        let layout = Layout::from_size_align(size, ARENA_ALIGN)
            .ok()
            .context(ConfigurationSnafu {
                reason: ConfigurationReason::CapacityTooLarge { requested: size },
            })?;
        let base = upstream
            .allocate(layout)
            .context(OutOfMemorySnafu { requested: size })?;
        unsafe {
            base.as_ptr().write_bytes(0, size);
        }
        Ok(Self {
            base,
            layout,
            upstream,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    /// Address of the first arena byte, for diagnostics and owner id seeds.
    pub(crate) fn base_addr(&self) -> usize {
        self.base.as_ptr().addr()
    }

    /// Returns a pointer to the byte at `offset`, which may be one past the
    /// end for zero-sized payloads.
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= self.len(), "offset {offset:#x} outside arena");
        unsafe { self.base.add(offset) }
    }

    /// Maps a pointer back to its offset, or `None` if it is neither inside
    /// the arena nor one past its end.
    pub(crate) fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = ptr.as_ptr().addr().checked_sub(self.base_addr())?;
        (offset <= self.len()).then_some(offset)
    }

    fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len()),
            "header at {offset:#x}+{len} outside arena"
        );
        unsafe { slice::from_raw_parts(self.base.as_ptr().add(offset), len) }
    }

    fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len()),
            "header at {offset:#x}+{len} outside arena"
        );
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr().add(offset), len) }
    }

    /// Reads a header record stored at `offset`.
    pub(crate) fn read<T>(&self, offset: usize) -> T
    where
        T: Pod,
    {
        DataView::from(self.bytes(offset, size_of::<T>())).read(0)
    }

    /// Writes a header record at `offset`.
    pub(crate) fn write<T>(&mut self, offset: usize, value: &T)
    where
        T: Pod,
    {
        DataView::from_mut(self.bytes_mut(offset, size_of::<T>())).write(0, value);
    }

    /// Copies every byte of `source` into this arena.
    pub(crate) fn copy_from(&mut self, source: &Self) {
        assert_eq!(self.len(), source.len());
        unsafe {
            self.base
                .as_ptr()
                .copy_from_nonoverlapping(source.base.as_ptr(), self.len());
        }
    }

    /// Whether this arena can take `source`'s bytes in place.
    pub(crate) fn is_compatible(&self, source: &Self) -> bool {
        self.layout == source.layout && self.upstream.is_equal(&source.upstream)
    }

    /// Acquires a new arena from a clone of this arena's upstream and copies
    /// this arena's bytes into it.
    pub(crate) fn duplicate(&self) -> Result<Self, AllocError>
    where
        U: Clone,
    {
        let mut copy = Self::new(self.upstream.clone(), self.len())?;
        copy.copy_from(self);
        Ok(copy)
    }

    pub(crate) fn layout(&self) -> Layout {
        self.layout
    }
}

impl<U> Drop for Arena<U>
where
    U: MemoryResource,
{
    fn drop(&mut self) {
        unsafe { self.upstream.deallocate(self.base, self.layout) }
    }
}
