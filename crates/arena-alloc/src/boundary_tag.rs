//! Boundary-tag allocator.
//!
//! The arena is cut into variable-size *spans*. Every span starts with a
//! [`SpanHeader`] recording its size and the owner tag of the allocator that
//! carved it. Free spans are additionally linked into a doubly linked free
//! list kept in address order; occupied spans are simply absent from it.
//!
//! ```text
//! Span Layout:
//! ┌───────────────────────────────────────────┬────────────────────────┐
//! │ SpanHeader (SPAN_HEADER_SIZE bytes)       │ Payload                │
//! │ ┌──────┬──────┬──────┬───────┬──────────┐ │                        │
//! │ │ size │ prev │ next │ owner │ reserved │ │                        │
//! │ └──────┴──────┴──────┴───────┴──────────┘ │                        │
//! └───────────────────────────────────────────┴────────────────────────┘
//! ```
//!
//! # Algorithm
//!
//! - **Allocation**: sweeps the free list with the active [`FitMode`]. The
//!   chosen span is split when the leftover can hold at least one header;
//!   otherwise it is handed out whole.
//! - **Deallocation**: links the span back into the free list at its address
//!   position. Adjacent free spans are *not* coalesced, which keeps
//!   deallocation a plain list insertion at the cost of fragmentation.
//!
//! # Performance Characteristics
//!
//! - **Allocation**: O(n) where n is the number of free spans
//! - **Deallocation**: O(n) where n is the number of free spans
//! - **Memory Overhead**: [`SPAN_HEADER_SIZE`] bytes per span

use alloc::vec::Vec;
use core::{alloc::Layout, ptr, ptr::NonNull};

use dataview::Pod;
use snafu::{OptionExt as _, ensure};
use spin::Mutex;

use crate::{
    ArenaAllocator,
    arena::{ARENA_ALIGN, Arena},
    error::{
        AllocError, ConfigurationReason, ConfigurationSnafu, InvalidBlockReason, InvalidBlockSnafu,
        OutOfMemorySnafu,
    },
    fit::{BlockInfo, FitMode},
    log::SharedLogger,
    owner::OwnerId,
    resource::{Global, MemoryResource},
};

/// Bytes reserved in front of every span's payload.
pub const SPAN_HEADER_SIZE: usize = size_of::<SpanHeader>().next_multiple_of(ARENA_ALIGN);

/// Null link of the free list.
const NIL: usize = usize::MAX;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
struct SpanHeader {
    /// Size of the span in bytes, header included.
    size: usize,
    /// Offset of the previous free span, or `NIL`. Unused while occupied.
    prev: usize,
    /// Offset of the next free span, or `NIL`. Unused while occupied.
    next: usize,
    owner: u32,
    _reserved: u32,
}

impl SpanHeader {
    fn new(size: usize, prev: usize, next: usize, owner: OwnerId) -> Self {
        Self {
            size,
            prev,
            next,
            owner: owner.bits(),
            _reserved: 0,
        }
    }
}

/// Arena state guarded by the allocator lock.
struct SpanArena<U>
where
    U: MemoryResource,
{
    arena: Arena<U>,
    free_head: usize,
    owner: OwnerId,
    fit_mode: FitMode,
    used: usize,
}

/// Outcome of a successful allocation, for diagnostics.
struct Carved {
    offset: usize,
    size: usize,
    split: bool,
}

impl<U> SpanArena<U>
where
    U: MemoryResource,
{
    fn new(arena: Arena<U>, fit_mode: FitMode) -> Self {
        let owner = OwnerId::generate(arena.base_addr());
        let mut this = Self {
            arena,
            free_head: 0,
            owner,
            fit_mode,
            used: 0,
        };
        let size = this.arena.len();
        this.set_header(0, &SpanHeader::new(size, NIL, NIL, owner));
        this
    }

    fn header(&self, offset: usize) -> SpanHeader {
        self.arena.read(offset)
    }

    fn set_header(&mut self, offset: usize, header: &SpanHeader) {
        self.arena.write(offset, header);
    }

    fn set_prev(&mut self, offset: usize, prev: usize) {
        let mut header = self.header(offset);
        header.prev = prev;
        self.set_header(offset, &header);
    }

    fn set_next(&mut self, offset: usize, next: usize) {
        let mut header = self.header(offset);
        header.next = next;
        self.set_header(offset, &header);
    }

    /// Points `prev`'s forward link at `after_prev` and `next`'s backward
    /// link at `before_next`. A `NIL` `prev` stands for the list head.
    fn relink(&mut self, prev: usize, next: usize, after_prev: usize, before_next: usize) {
        if prev == NIL {
            self.free_head = after_prev;
        } else {
            self.set_next(prev, after_prev);
        }
        if next != NIL {
            self.set_prev(next, before_next);
        }
    }

    fn free_spans(&self) -> FreeSpans<'_, U> {
        FreeSpans {
            state: self,
            next: self.free_head,
        }
    }

    fn spans(&self) -> SpanCursor<'_, U> {
        SpanCursor {
            state: self,
            offset: 0,
            next_free: self.free_head,
        }
    }

    fn carve(&mut self, size: usize) -> Result<Carved, AllocError> {
        let total = size
            .checked_next_multiple_of(ARENA_ALIGN)
            .and_then(|size| size.checked_add(SPAN_HEADER_SIZE))
            .context(OutOfMemorySnafu { requested: size })?;
        let span = self
            .fit_mode
            .select(self.free_spans(), total)
            .context(OutOfMemorySnafu { requested: size })?;

        let header = self.header(span.offset);
        let remainder = span.size - total;
        let split = remainder >= SPAN_HEADER_SIZE;
        let taken = if split {
            // The leftover takes the chosen span's place in the free list.
            let rest = span.offset + total;
            self.set_header(
                rest,
                &SpanHeader::new(remainder, header.prev, header.next, self.owner),
            );
            self.relink(header.prev, header.next, rest, rest);
            total
        } else {
            self.relink(header.prev, header.next, header.next, header.prev);
            span.size
        };

        self.set_header(span.offset, &SpanHeader::new(taken, NIL, NIL, self.owner));
        self.used += taken;
        Ok(Carved {
            offset: span.offset,
            size: taken,
            split,
        })
    }

    /// Returns the span whose payload starts at `payload` to the free list,
    /// returning the span size.
    fn release(&mut self, payload: usize) -> Result<usize, AllocError> {
        let address = self.arena.base_addr() + payload;
        ensure!(
            payload >= SPAN_HEADER_SIZE && payload.is_multiple_of(ARENA_ALIGN),
            InvalidBlockSnafu {
                address,
                reason: InvalidBlockReason::Misaligned,
            }
        );
        let start = payload - SPAN_HEADER_SIZE;
        let header = self.header(start);
        ensure!(
            header.owner == self.owner.bits(),
            InvalidBlockSnafu {
                address,
                reason: InvalidBlockReason::OwnerMismatch {
                    expected: self.owner,
                    found: OwnerId::from_bits(header.owner),
                },
            }
        );
        ensure!(
            header.size >= SPAN_HEADER_SIZE
                && start
                    .checked_add(header.size)
                    .is_some_and(|end| end <= self.arena.len()),
            InvalidBlockSnafu {
                address,
                reason: InvalidBlockReason::CorruptHeader,
            }
        );

        let mut prev = NIL;
        let mut next = self.free_head;
        while next != NIL && next < start {
            prev = next;
            next = self.header(next).next;
        }
        debug_assert_ne!(next, start, "span at {start:#x} freed twice");

        self.set_header(start, &SpanHeader::new(header.size, prev, next, self.owner));
        self.relink(prev, next, start, start);
        self.used -= header.size;
        Ok(header.size)
    }
}

/// Walks the free list in address order.
struct FreeSpans<'a, U>
where
    U: MemoryResource,
{
    state: &'a SpanArena<U>,
    next: usize,
}

impl<U> Iterator for FreeSpans<'_, U>
where
    U: MemoryResource,
{
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NIL {
            return None;
        }
        let offset = self.next;
        let header = self.state.header(offset);
        self.next = header.next;
        Some(BlockInfo::free(offset, header.size))
    }
}

/// Walks every span from the arena start.
///
/// Occupancy is not stored in span headers; a span is free exactly when the
/// free list reaches it at the same position.
struct SpanCursor<'a, U>
where
    U: MemoryResource,
{
    state: &'a SpanArena<U>,
    offset: usize,
    next_free: usize,
}

impl<U> Iterator for SpanCursor<'_, U>
where
    U: MemoryResource,
{
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.state.arena.len() {
            return None;
        }
        let header = self.state.header(self.offset);
        assert!(header.size > 0, "empty span at {:#x}", self.offset);
        let occupied = self.offset != self.next_free;
        if !occupied {
            self.next_free = header.next;
        }
        let block = BlockInfo {
            offset: self.offset,
            size: header.size,
            occupied,
        };
        self.offset = block.end();
        Some(block)
    }
}

/// A variable-size free-list allocator over a fixed arena.
///
/// All operations lock the arena for their whole duration, so an allocator
/// can be shared between threads.
pub struct BoundaryTagAllocator<U = Global>
where
    U: MemoryResource,
{
    state: Mutex<SpanArena<U>>,
    logger: Option<SharedLogger>,
}

impl BoundaryTagAllocator<Global> {
    /// Creates an allocator with a `capacity`-byte arena from the process
    /// allocator.
    pub fn new(capacity: usize, fit_mode: FitMode) -> Result<Self, AllocError> {
        Self::new_in(capacity, Global, None, fit_mode)
    }
}

impl<U> BoundaryTagAllocator<U>
where
    U: MemoryResource,
{
    /// Creates an allocator with a `capacity`-byte arena taken from
    /// `upstream`.
    ///
    /// The whole arena starts out as a single free span. `capacity` must be
    /// at least [`SPAN_HEADER_SIZE`].
    pub fn new_in(
        capacity: usize,
        upstream: U,
        logger: Option<SharedLogger>,
        fit_mode: FitMode,
    ) -> Result<Self, AllocError> {
        ensure!(
            capacity >= SPAN_HEADER_SIZE,
            ConfigurationSnafu {
                reason: ConfigurationReason::CapacityTooSmall {
                    capacity,
                    minimum: SPAN_HEADER_SIZE,
                },
            }
        );
        let arena = Arena::new(upstream, capacity)?;
        let state = SpanArena::new(arena, fit_mode);
        info!(
            logger,
            "boundary-tag arena {}: created with {capacity} bytes at {:#x} ({fit_mode})",
            state.owner,
            state.arena.base_addr(),
        );
        Ok(Self {
            state: Mutex::new(state),
            logger,
        })
    }

    /// Allocates `size` bytes.
    ///
    /// The returned pointer is aligned to [`ARENA_ALIGN`](crate::ARENA_ALIGN)
    /// and valid for `size` bytes until it is passed to
    /// [`deallocate`](Self::deallocate) or the allocator is dropped.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let mut state = self.state.lock();
        match state.carve(size) {
            Ok(carved) => {
                trace!(
                    self.logger,
                    "boundary-tag arena {}: allocated {size} bytes in span {:#x}+{}{}",
                    state.owner,
                    carved.offset,
                    carved.size,
                    if carved.split { " (split)" } else { "" },
                );
                Ok(state.arena.ptr_at(carved.offset + SPAN_HEADER_SIZE))
            }
            Err(err) => {
                warn!(self.logger, "boundary-tag arena {}: {err}", state.owner);
                Err(err)
            }
        }
    }

    /// Returns a block to the allocator.
    ///
    /// Pointers outside the arena, pointers that do not start a payload, and
    /// headers stamped by another allocator are rejected with
    /// [`AllocError::InvalidBlock`].
    ///
    /// # Safety
    ///
    /// `ptr` must either have been returned by [`allocate`](Self::allocate)
    /// on this allocator and not been deallocated since, or point outside
    /// this allocator's arena. Freeing a block twice is not detected.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let mut state = self.state.lock();
        let result = state
            .arena
            .offset_of(ptr)
            .context(InvalidBlockSnafu {
                address: ptr.as_ptr().addr(),
                reason: InvalidBlockReason::OutsideArena,
            })
            .and_then(|payload| state.release(payload));
        match result {
            Ok(size) => {
                trace!(
                    self.logger,
                    "boundary-tag arena {}: released span of {size} bytes at {:p}",
                    state.owner,
                    ptr,
                );
                Ok(())
            }
            Err(err) => {
                error!(self.logger, "boundary-tag arena {}: {err}", state.owner);
                Err(err)
            }
        }
    }

    /// Replaces the placement policy used by later allocations.
    pub fn set_fit_mode(&self, fit_mode: FitMode) {
        let mut state = self.state.lock();
        debug!(
            self.logger,
            "boundary-tag arena {}: fit mode {} -> {fit_mode}", state.owner, state.fit_mode
        );
        state.fit_mode = fit_mode;
    }

    #[must_use]
    pub fn fit_mode(&self) -> FitMode {
        self.state.lock().fit_mode
    }

    /// Lists every span in address order.
    #[must_use]
    pub fn blocks_info(&self) -> Vec<BlockInfo> {
        self.state.lock().spans().collect()
    }

    /// Size of the arena in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().arena.len()
    }

    /// Bytes held by occupied spans, headers included.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.state.lock().used
    }

    /// Owner tag stamped into this allocator's span headers.
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.state.lock().owner
    }
}

impl<U> Drop for BoundaryTagAllocator<U>
where
    U: MemoryResource,
{
    fn drop(&mut self) {
        let state = self.state.get_mut();
        debug!(
            self.logger,
            "boundary-tag arena {}: released with {} bytes still in use", state.owner, state.used
        );
    }
}

impl<U> ArenaAllocator for BoundaryTagAllocator<U>
where
    U: MemoryResource,
{
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        Self::allocate(self, size)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        unsafe { Self::deallocate(self, ptr) }
    }

    fn set_fit_mode(&self, fit_mode: FitMode) {
        Self::set_fit_mode(self, fit_mode);
    }

    fn fit_mode(&self) -> FitMode {
        Self::fit_mode(self)
    }

    fn blocks_info(&self) -> Vec<BlockInfo> {
        Self::blocks_info(self)
    }

    fn capacity(&self) -> usize {
        Self::capacity(self)
    }

    fn used_bytes(&self) -> usize {
        Self::used_bytes(self)
    }
}

impl<U> MemoryResource for BoundaryTagAllocator<U>
where
    U: MemoryResource,
{
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.align() > ARENA_ALIGN {
            return None;
        }
        Self::allocate(self, layout.size()).ok()
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        // Failures are already logged by the inherent method.
        let _ = unsafe { Self::deallocate(self, ptr) };
    }

    fn is_equal(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}
