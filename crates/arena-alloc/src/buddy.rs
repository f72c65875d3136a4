//! Binary buddy allocator.
//!
//! The arena is a single power-of-two *run* of order `k` that is recursively
//! halved on demand. Every run starts with a packed 32-bit header word; an
//! occupied run also stores a back-reference to its own start, which lets
//! deallocation reject pointers that were never handed out.
//!
//! ```text
//! Occupied Run Layout (2^order bytes):
//! ┌────────────┬──────────┬────────────────────┬─────────────────────────┐
//! │ RunHeader  │ (unused) │ back-reference     │ Payload                 │
//! │ 4 bytes    │          │ at BACK_REF_OFFSET │ at OCCUPIED_OVERHEAD    │
//! └────────────┴──────────┴────────────────────┴─────────────────────────┘
//!
//! RunHeader bits:
//! ┌──────────────────────────┬───────────────┬──────────┐
//! │ owner (bits 8..32)       │ order (1..8)  │ occupied │
//! └──────────────────────────┴───────────────┴──────────┘
//! ```
//!
//! The buddy of the run at offset `o` with order `j` lives at `o ^ 2^j`.
//! Freed runs merge with their buddy for as long as the buddy is a free run of
//! the same order.

use alloc::{alloc::handle_alloc_error, vec::Vec};
use core::{alloc::Layout, ptr, ptr::NonNull};

use bitflags::bitflags;
use dataview::Pod;
use snafu::{OptionExt as _, ensure};
use spin::{Mutex, MutexGuard};

use crate::{
    ArenaAllocator,
    arena::{ARENA_ALIGN, Arena},
    error::{
        AllocError, ConfigurationReason, ConfigurationSnafu, DoubleFreeSnafu, InvalidBlockReason,
        InvalidBlockSnafu, OutOfMemorySnafu,
    },
    fit::{BlockInfo, FitMode},
    log::SharedLogger,
    owner::OwnerId,
    resource::{Global, MemoryResource},
};

/// Smallest run order. A run of this order holds exactly the metadata of an
/// occupied run.
pub const MIN_ORDER: u32 = 4;

/// Bytes in front of every payload.
pub const OCCUPIED_OVERHEAD: usize = 1 << MIN_ORDER;

const BACK_REF_OFFSET: usize = 8;

const _: () = assert!(BACK_REF_OFFSET + size_of::<usize>() <= OCCUPIED_OVERHEAD);
const _: () = assert!(size_of::<RunHeader>() <= BACK_REF_OFFSET);

bitflags! {
    /// State bits of a run header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct RunFlags: u32 {
        /// The run is handed out to a caller.
        const OCCUPIED = 1 << 0;
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, Pod)]
struct RunHeader(u32);

const FLAGS_MASK: u32 = 1;
const FLAGS_SHIFT: u32 = 0;
const ORDER_MASK: u32 = ((1 << 7) - 1) << 1;
const ORDER_SHIFT: u32 = 1;
const OWNER_MASK: u32 = ((1 << 24) - 1) << 8;
const OWNER_SHIFT: u32 = 8;

const _: () = assert!(FLAGS_MASK.is_power_of_two());
const _: () = assert!(ORDER_MASK.count_ones() == 7);
const _: () = assert!(OWNER_MASK.count_ones() == OwnerId::BITS);
const _: () = assert!(FLAGS_MASK & ORDER_MASK == 0 && ORDER_MASK & OWNER_MASK == 0);

impl RunHeader {
    fn new(order: u32, flags: RunFlags, owner: OwnerId) -> Self {
        debug_assert!(order <= ORDER_MASK >> ORDER_SHIFT);
        Self(
            ((flags.bits() << FLAGS_SHIFT) & FLAGS_MASK)
                | ((order << ORDER_SHIFT) & ORDER_MASK)
                | ((owner.bits() << OWNER_SHIFT) & OWNER_MASK),
        )
    }

    fn flags(self) -> RunFlags {
        RunFlags::from_bits_truncate((self.0 & FLAGS_MASK) >> FLAGS_SHIFT)
    }

    fn is_occupied(self) -> bool {
        self.flags().contains(RunFlags::OCCUPIED)
    }

    fn order(self) -> u32 {
        (self.0 & ORDER_MASK) >> ORDER_SHIFT
    }

    fn owner(self) -> OwnerId {
        OwnerId::from_bits((self.0 & OWNER_MASK) >> OWNER_SHIFT)
    }

    fn with_owner(self, owner: OwnerId) -> Self {
        Self::new(self.order(), self.flags(), owner)
    }
}

const fn run_size(order: u32) -> usize {
    1 << order
}

/// Arena state guarded by the allocator lock.
struct BuddyState<U>
where
    U: MemoryResource,
{
    arena: Arena<U>,
    order: u32,
    owner: OwnerId,
    fit_mode: FitMode,
    used: usize,
}

struct Carved {
    offset: usize,
    order: u32,
    splits: u32,
}

impl<U> BuddyState<U>
where
    U: MemoryResource,
{
    fn new(arena: Arena<U>, order: u32, fit_mode: FitMode) -> Self {
        let owner = OwnerId::generate(arena.base_addr());
        let mut this = Self {
            arena,
            order,
            owner,
            fit_mode,
            used: 0,
        };
        this.set_header(0, RunHeader::new(order, RunFlags::empty(), owner));
        this
    }

    fn header(&self, offset: usize) -> RunHeader {
        self.arena.read(offset)
    }

    fn set_header(&mut self, offset: usize, header: RunHeader) {
        self.arena.write(offset, &header);
    }

    fn runs(&self) -> RunCursor<'_, U> {
        RunCursor {
            state: self,
            offset: 0,
        }
    }

    /// Stamps `owner` into every run header.
    fn restamp(&mut self, owner: OwnerId) {
        self.owner = owner;
        let mut offset = 0;
        while offset < self.arena.len() {
            let header = self.header(offset);
            self.set_header(offset, header.with_owner(owner));
            offset += run_size(header.order());
        }
    }

    /// Copies this state into a fresh arena with its own owner id.
    fn duplicate(&self) -> Result<Self, AllocError>
    where
        U: Clone,
    {
        let arena = self.arena.duplicate()?;
        let owner = OwnerId::generate(arena.base_addr());
        let mut copy = Self {
            arena,
            order: self.order,
            owner,
            fit_mode: self.fit_mode,
            used: self.used,
        };
        copy.restamp(owner);
        Ok(copy)
    }

    fn carve(&mut self, size: usize) -> Result<Carved, AllocError> {
        let order = size
            .checked_add(OCCUPIED_OVERHEAD)
            .and_then(usize::checked_next_power_of_two)
            .map(|size| size.trailing_zeros().max(MIN_ORDER))
            .filter(|order| *order <= self.order)
            .context(OutOfMemorySnafu { requested: size })?;
        let run = self
            .fit_mode
            .select(self.runs(), run_size(order))
            .context(OutOfMemorySnafu { requested: size })?;

        let mut run_order = run.size.trailing_zeros();
        let mut splits = 0;
        while run_order > order {
            run_order -= 1;
            let buddy = run.offset + run_size(run_order);
            self.set_header(
                buddy,
                RunHeader::new(run_order, RunFlags::empty(), self.owner),
            );
            splits += 1;
        }
        self.set_header(run.offset, RunHeader::new(order, RunFlags::OCCUPIED, self.owner));
        self.arena.write(run.offset + BACK_REF_OFFSET, &run.offset);
        self.used += run_size(order);
        Ok(Carved {
            offset: run.offset,
            order,
            splits,
        })
    }

    /// Frees the run whose payload starts at `payload` and merges it upward,
    /// returning the order of the freed run and the order it merged into.
    fn release(&mut self, payload: usize) -> Result<(u32, u32), AllocError> {
        let address = self.arena.base_addr() + payload;
        ensure!(
            payload >= OCCUPIED_OVERHEAD && payload.is_multiple_of(run_size(MIN_ORDER)),
            InvalidBlockSnafu {
                address,
                reason: InvalidBlockReason::Misaligned,
            }
        );
        let start = payload - OCCUPIED_OVERHEAD;
        let back_ref: usize = self.arena.read(start + BACK_REF_OFFSET);
        ensure!(
            back_ref == start,
            InvalidBlockSnafu {
                address,
                reason: InvalidBlockReason::BackReferenceMismatch { found: back_ref },
            }
        );
        let header = self.header(start);
        ensure!(
            header.owner() == self.owner,
            InvalidBlockSnafu {
                address,
                reason: InvalidBlockReason::OwnerMismatch {
                    expected: self.owner,
                    found: header.owner(),
                },
            }
        );
        let order = header.order();
        ensure!(
            (MIN_ORDER..=self.order).contains(&order) && start.is_multiple_of(run_size(order)),
            InvalidBlockSnafu {
                address,
                reason: InvalidBlockReason::CorruptHeader,
            }
        );
        ensure!(header.is_occupied(), DoubleFreeSnafu { address });

        self.used -= run_size(order);
        let mut start = start;
        let mut merged = order;
        self.set_header(start, RunHeader::new(merged, RunFlags::empty(), self.owner));
        while merged < self.order {
            let buddy = start ^ run_size(merged);
            let buddy_header = self.header(buddy);
            if buddy_header.is_occupied()
                || buddy_header.order() != merged
                || buddy_header.owner() != self.owner
            {
                break;
            }
            start = start.min(buddy);
            merged += 1;
            self.set_header(start, RunHeader::new(merged, RunFlags::empty(), self.owner));
        }
        Ok((order, merged))
    }
}

/// Walks every run from the arena start.
struct RunCursor<'a, U>
where
    U: MemoryResource,
{
    state: &'a BuddyState<U>,
    offset: usize,
}

impl<U> Iterator for RunCursor<'_, U>
where
    U: MemoryResource,
{
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.state.arena.len() {
            return None;
        }
        let header = self.state.header(self.offset);
        assert!(
            (MIN_ORDER..=self.state.order).contains(&header.order()),
            "corrupt run header at {:#x}",
            self.offset
        );
        let block = BlockInfo {
            offset: self.offset,
            size: run_size(header.order()),
            occupied: header.is_occupied(),
        };
        self.offset = block.end();
        Some(block)
    }
}

/// A power-of-two buddy allocator over a fixed arena.
///
/// Unlike [`BoundaryTagAllocator`](crate::BoundaryTagAllocator), a buddy
/// allocator detects double frees and coalesces freed runs. It can also be
/// cloned: the copy owns a byte-for-byte duplicate of the arena under a new
/// owner id.
pub struct BuddyAllocator<U = Global>
where
    U: MemoryResource,
{
    state: Mutex<BuddyState<U>>,
    logger: Option<SharedLogger>,
}

impl BuddyAllocator<Global> {
    /// Creates an allocator whose arena is `size_hint` rounded up to a power
    /// of two, taken from the process allocator.
    pub fn new(size_hint: usize, fit_mode: FitMode) -> Result<Self, AllocError> {
        Self::new_in(size_hint, Global, None, fit_mode)
    }
}

impl<U> BuddyAllocator<U>
where
    U: MemoryResource,
{
    /// Creates an allocator whose arena is `size_hint` rounded up to a power
    /// of two, taken from `upstream`.
    ///
    /// The rounded size must be at least `2^MIN_ORDER` bytes.
    pub fn new_in(
        size_hint: usize,
        upstream: U,
        logger: Option<SharedLogger>,
        fit_mode: FitMode,
    ) -> Result<Self, AllocError> {
        let size = size_hint
            .checked_next_power_of_two()
            .context(ConfigurationSnafu {
                reason: ConfigurationReason::CapacityTooLarge {
                    requested: size_hint,
                },
            })?;
        let order = size.trailing_zeros();
        ensure!(
            size_hint > 0 && order >= MIN_ORDER,
            ConfigurationSnafu {
                reason: ConfigurationReason::OrderTooSmall {
                    order,
                    minimum: MIN_ORDER,
                },
            }
        );
        let arena = Arena::new(upstream, size)?;
        let state = BuddyState::new(arena, order, fit_mode);
        info!(
            logger,
            "buddy arena {}: created with order {order} ({size} bytes) at {:#x} ({fit_mode})",
            state.owner,
            state.arena.base_addr(),
        );
        Ok(Self {
            state: Mutex::new(state),
            logger,
        })
    }

    /// Allocates `size` bytes from the smallest run order that holds them.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let mut state = self.state.lock();
        match state.carve(size) {
            Ok(carved) => {
                trace!(
                    self.logger,
                    "buddy arena {}: allocated {size} bytes in run {:#x} of order {} after {} splits",
                    state.owner,
                    carved.offset,
                    carved.order,
                    carved.splits,
                );
                Ok(state.arena.ptr_at(carved.offset + OCCUPIED_OVERHEAD))
            }
            Err(err) => {
                warn!(self.logger, "buddy arena {}: {err}", state.owner);
                Err(err)
            }
        }
    }

    /// Returns a block to the allocator, merging it with free buddies.
    ///
    /// # Safety
    ///
    /// `ptr` must either have been returned by [`allocate`](Self::allocate)
    /// on this allocator, or point outside this allocator's arena. Freeing a
    /// block twice is reported as [`AllocError::DoubleFree`] as long as its
    /// run has not been handed out again in the meantime.
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
            Ok((order, merged)) => {
                trace!(
                    self.logger,
                    "buddy arena {}: released run of order {order} at {:p}, merged up to order {merged}",
                    state.owner,
                    ptr,
                );
                Ok(())
            }
            Err(err @ AllocError::DoubleFree { .. }) => {
                critical!(self.logger, "buddy arena {}: {err}", state.owner);
                Err(err)
            }
            Err(err) => {
                error!(self.logger, "buddy arena {}: {err}", state.owner);
                Err(err)
            }
        }
    }

    /// Replaces the placement policy used by later allocations.
    pub fn set_fit_mode(&self, fit_mode: FitMode) {
        let mut state = self.state.lock();
        debug!(
            self.logger,
            "buddy arena {}: fit mode {} -> {fit_mode}", state.owner, state.fit_mode
        );
        state.fit_mode = fit_mode;
    }

    #[must_use]
    pub fn fit_mode(&self) -> FitMode {
        self.state.lock().fit_mode
    }

    /// Lists every run in address order.
    #[must_use]
    pub fn blocks_info(&self) -> Vec<BlockInfo> {
        self.state.lock().runs().collect()
    }

    /// Order `k` of the arena, which is `2^k` bytes long.
    #[must_use]
    pub fn order(&self) -> u32 {
        self.state.lock().order
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().arena.len()
    }

    /// Bytes held by occupied runs, metadata included.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.state.lock().used
    }

    /// Owner tag stamped into this allocator's run headers.
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.state.lock().owner
    }
}

impl<U> BuddyAllocator<U>
where
    U: MemoryResource + Clone,
{
    /// Clones the allocator, reporting upstream exhaustion as an error.
    ///
    /// Blocks of `self` remain owned by `self`; the copy accepts only
    /// pointers into its own arena.
    pub fn try_clone(&self) -> Result<Self, AllocError> {
        let state = self.state.lock();
        let copy = state.duplicate()?;
        debug!(
            self.logger,
            "buddy arena {}: cloned into {} at {:#x}",
            state.owner,
            copy.owner,
            copy.arena.base_addr(),
        );
        Ok(Self {
            state: Mutex::new(copy),
            logger: self.logger.clone(),
        })
    }
}

impl<U> Clone for BuddyAllocator<U>
where
    U: MemoryResource + Clone,
{
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(copy) => copy,
            Err(_) => handle_alloc_error(self.state.lock().arena.layout()),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        let (mut target, source_state) = lock_pair(&self.state, &source.state);
        if target.arena.is_compatible(&source_state.arena) {
            target.arena.copy_from(&source_state.arena);
            target.order = source_state.order;
            target.fit_mode = source_state.fit_mode;
            target.used = source_state.used;
            let owner = OwnerId::generate(target.arena.base_addr());
            target.restamp(owner);
        } else {
            match source_state.duplicate() {
                Ok(copy) => *target = copy,
                Err(_) => handle_alloc_error(source_state.arena.layout()),
            }
        }
        self.logger.clone_from(&source.logger);
        debug!(
            self.logger,
            "buddy arena {}: overwritten from {}", target.owner, source_state.owner
        );
    }
}

/// Locks two instances in address order, returning the guards in argument
/// order.
fn lock_pair<'a, T>(a: &'a Mutex<T>, b: &'a Mutex<T>) -> (MutexGuard<'a, T>, MutexGuard<'a, T>) {
    if ptr::from_ref(a) < ptr::from_ref(b) {
        let first = a.lock();
        (first, b.lock())
    } else {
        let second = b.lock();
        (a.lock(), second)
    }
}

impl<U> Drop for BuddyAllocator<U>
where
    U: MemoryResource,
{
    fn drop(&mut self) {
        let state = self.state.get_mut();
        debug!(
            self.logger,
            "buddy arena {}: released with {} bytes still in use", state.owner, state.used
        );
    }
}

impl<U> ArenaAllocator for BuddyAllocator<U>
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

impl<U> MemoryResource for BuddyAllocator<U>
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

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::{sync::Arc, vec};

    use super::*;
    use crate::{
        BoundaryTagAllocator,
        log::{Severity, tests::RecordingLogger},
    };

    fn free(offset: usize, size: usize) -> BlockInfo {
        BlockInfo::free(offset, size)
    }

    fn occupied(offset: usize, size: usize) -> BlockInfo {
        BlockInfo {
            offset,
            size,
            occupied: true,
        }
    }

    fn offset_of(allocator: &BuddyAllocator, ptr: NonNull<u8>) -> usize {
        let base = allocator.state.lock().arena.base_addr();
        ptr.as_ptr().addr() - base - OCCUPIED_OVERHEAD
    }

    fn reason(err: &AllocError) -> Option<InvalidBlockReason> {
        match err {
            AllocError::InvalidBlock { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    #[test]
    fn test_run_header_packing() {
        let owner = OwnerId::from_bits(0xAB_CDEF);
        let header = RunHeader::new(42, RunFlags::OCCUPIED, owner);
        assert_eq!(header.0, (0xAB_CDEF << 8) | (42 << 1) | 1);
        assert!(header.is_occupied());
        assert_eq!(header.order(), 42);
        assert_eq!(header.owner(), owner);

        let other = OwnerId::from_bits(7);
        let restamped = header.with_owner(other);
        assert_eq!(restamped.order(), 42);
        assert!(restamped.is_occupied());
        assert_eq!(restamped.owner(), other);
    }

    #[test]
    fn test_size_is_rounded_to_power_of_two() {
        for (size_hint, order) in [(15, 4), (16, 4), (17, 5), (64, 6), (1000, 10), (1024, 10)] {
            let allocator = BuddyAllocator::new(size_hint, FitMode::FirstFit).unwrap();
            assert_eq!(allocator.order(), order);
            assert_eq!(allocator.capacity(), 1 << order);
            assert_eq!(allocator.blocks_info(), [free(0, 1 << order)]);
        }
    }

    #[test]
    fn test_small_orders_are_rejected() {
        for size_hint in [0, 1, 8] {
            let Err(err) = BuddyAllocator::new(size_hint, FitMode::FirstFit) else {
                panic!("size hint {size_hint} must be rejected");
            };
            assert!(matches!(
                err,
                AllocError::Configuration {
                    reason: ConfigurationReason::OrderTooSmall { minimum: 4, .. },
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_huge_sizes_are_rejected() {
        for size_hint in [usize::MAX, 1 << (usize::BITS - 1)] {
            let Err(err) = BuddyAllocator::new(size_hint, FitMode::FirstFit) else {
                panic!("size hint {size_hint:#x} must be rejected");
            };
            assert!(matches!(
                err,
                AllocError::Configuration {
                    reason: ConfigurationReason::CapacityTooLarge { .. },
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_two_minimal_allocations_merge_back() {
        for reverse in [false, true] {
            let allocator = BuddyAllocator::new(64, FitMode::FirstFit).unwrap();
            let a = allocator.allocate(1).unwrap();
            let b = allocator.allocate(1).unwrap();
            assert_eq!(allocator.blocks_info(), [occupied(0, 32), occupied(32, 32)]);
            assert_eq!(allocator.used_bytes(), 64);

            let (first, second) = if reverse { (b, a) } else { (a, b) };
            unsafe { allocator.deallocate(first) }.unwrap();
            assert_eq!(allocator.blocks_info().iter().filter(|b| b.occupied).count(), 1);
            unsafe { allocator.deallocate(second) }.unwrap();
            assert_eq!(allocator.blocks_info(), [free(0, 64)]);
            assert_eq!(allocator.used_bytes(), 0);
        }
    }

    #[test]
    fn test_allocation_splits_down_to_order() {
        let allocator = BuddyAllocator::new(1024, FitMode::FirstFit).unwrap();
        let ptr = allocator.allocate(1).unwrap();
        assert_eq!(ptr.as_ptr().addr() % OCCUPIED_OVERHEAD, 0);
        assert_eq!(
            allocator.blocks_info(),
            [
                occupied(0, 32),
                free(32, 32),
                free(64, 64),
                free(128, 128),
                free(256, 256),
                free(512, 512),
            ]
        );
        unsafe { allocator.deallocate(ptr) }.unwrap();
        assert_eq!(allocator.blocks_info(), [free(0, 1024)]);
    }

    #[test]
    fn test_zero_sized_allocation_uses_minimal_run() {
        let allocator = BuddyAllocator::new(16, FitMode::FirstFit).unwrap();
        let ptr = allocator.allocate(0).unwrap();
        assert_eq!(allocator.blocks_info(), [occupied(0, 16)]);
        assert!(allocator.allocate(0).unwrap_err().is_out_of_memory());
        unsafe { allocator.deallocate(ptr) }.unwrap();
    }

    #[test]
    fn test_out_of_memory() {
        let allocator = BuddyAllocator::new(64, FitMode::FirstFit).unwrap();
        assert!(allocator.allocate(64 - OCCUPIED_OVERHEAD + 1).unwrap_err().is_out_of_memory());
        assert!(allocator.allocate(usize::MAX).unwrap_err().is_out_of_memory());

        let whole = allocator.allocate(64 - OCCUPIED_OVERHEAD).unwrap();
        assert!(allocator.allocate(0).unwrap_err().is_out_of_memory());
        unsafe { allocator.deallocate(whole) }.unwrap();
    }

    #[test]
    fn test_fit_modes_choose_different_runs() {
        for (fit_mode, expected) in [
            (FitMode::FirstFit, 0),
            (FitMode::BestFit, 96),
            (FitMode::WorstFit, 128),
        ] {
            let allocator = BuddyAllocator::new(256, FitMode::FirstFit).unwrap();
            let large = allocator.allocate(40).unwrap();
            let small = allocator.allocate(1).unwrap();
            assert_eq!(offset_of(&allocator, small), 64);
            unsafe { allocator.deallocate(large) }.unwrap();
            assert_eq!(
                allocator.blocks_info(),
                [free(0, 64), occupied(64, 32), free(96, 32), free(128, 128)]
            );

            allocator.set_fit_mode(fit_mode);
            let ptr = allocator.allocate(1).unwrap();
            assert_eq!(offset_of(&allocator, ptr), expected, "{fit_mode}");
            unsafe {
                allocator.deallocate(ptr).unwrap();
                allocator.deallocate(small).unwrap();
            }
            assert_eq!(allocator.blocks_info(), [free(0, 256)]);
        }
    }

    #[test]
    fn test_everything_merges_back() {
        let allocator = BuddyAllocator::new(4096, FitMode::BestFit).unwrap();
        let mut ptrs = vec![];
        for size in [1, 100, 17, 500, 3, 60, 250, 16, 1000] {
            ptrs.push(allocator.allocate(size).unwrap());
        }
        let sum: usize = allocator.blocks_info().iter().map(|b| b.size).sum();
        assert_eq!(sum, 4096);

        for index in [3, 0, 8, 5, 1, 7, 2, 6, 4] {
            unsafe { allocator.deallocate(ptrs[index]) }.unwrap();
        }
        assert_eq!(allocator.blocks_info(), [free(0, 4096)]);
        assert_eq!(allocator.used_bytes(), 0);
    }

    #[test]
    fn test_double_free() {
        let allocator = BuddyAllocator::new(64, FitMode::FirstFit).unwrap();
        let a = allocator.allocate(1).unwrap();
        let b = allocator.allocate(1).unwrap();

        unsafe { allocator.deallocate(a) }.unwrap();
        let err = unsafe { allocator.deallocate(a) }.unwrap_err();
        assert!(err.is_double_free());

        unsafe { allocator.deallocate(b) }.unwrap();
        let err = unsafe { allocator.deallocate(b) }.unwrap_err();
        assert!(err.is_double_free());
        assert_eq!(allocator.blocks_info(), [free(0, 64)]);
    }

    #[test]
    fn test_foreign_pointer_is_invalid() {
        let a = BuddyAllocator::new(256, FitMode::FirstFit).unwrap();
        let b = BuddyAllocator::new(256, FitMode::FirstFit).unwrap();
        let ptr = a.allocate(8).unwrap();
        let err = unsafe { b.deallocate(ptr) }.unwrap_err();
        assert_eq!(reason(&err), Some(InvalidBlockReason::OutsideArena));
        assert_eq!(b.blocks_info(), [free(0, 256)]);
        unsafe { a.deallocate(ptr) }.unwrap();
    }

    #[test]
    fn test_interior_pointers_are_invalid() {
        let allocator = BuddyAllocator::new(256, FitMode::FirstFit).unwrap();
        let ptr = allocator.allocate(100).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(0, 100);
        }
        let before = allocator.blocks_info();

        let misaligned = unsafe { ptr.add(8) };
        let err = unsafe { allocator.deallocate(misaligned) }.unwrap_err();
        assert_eq!(reason(&err), Some(InvalidBlockReason::Misaligned));

        let interior = unsafe { ptr.add(32) };
        let err = unsafe { allocator.deallocate(interior) }.unwrap_err();
        assert_eq!(
            reason(&err),
            Some(InvalidBlockReason::BackReferenceMismatch { found: 0 })
        );

        // Forge a back-reference so that the owner check is reached.
        let fake_start = offset_of(&allocator, ptr) + OCCUPIED_OVERHEAD + 16;
        unsafe {
            ptr.add(16 + BACK_REF_OFFSET).cast::<usize>().write_unaligned(fake_start);
        }
        let err = unsafe { allocator.deallocate(interior) }.unwrap_err();
        assert!(matches!(
            reason(&err),
            Some(InvalidBlockReason::OwnerMismatch { found, .. }) if found.bits() == 0
        ));

        let forged = RunHeader::new(2, RunFlags::OCCUPIED, allocator.owner());
        unsafe {
            ptr.add(16).cast::<u32>().write_unaligned(forged.0);
        }
        let err = unsafe { allocator.deallocate(interior) }.unwrap_err();
        assert_eq!(reason(&err), Some(InvalidBlockReason::CorruptHeader));

        assert_eq!(allocator.blocks_info(), before);
        unsafe { allocator.deallocate(ptr) }.unwrap();
        assert_eq!(allocator.blocks_info(), [free(0, 256)]);
    }

    #[test]
    fn test_clone_restamps_owner() {
        let original = BuddyAllocator::new(512, FitMode::WorstFit).unwrap();
        let a = original.allocate(30).unwrap();
        let b = original.allocate(100).unwrap();
        unsafe {
            a.as_ptr().write_bytes(0xA5, 30);
        }

        let copy = original.clone();
        assert_ne!(copy.owner(), original.owner());
        assert_eq!(copy.blocks_info(), original.blocks_info());
        assert_eq!(copy.fit_mode(), FitMode::WorstFit);
        assert_eq!(copy.used_bytes(), original.used_bytes());
        let copy_owner = copy.owner();
        {
            let state = copy.state.lock();
            for run in state.runs() {
                assert_eq!(state.header(run.offset).owner(), copy_owner);
            }
        }

        // The range check rejects a pointer into the original's arena before
        // its header is ever read.
        let err = unsafe { copy.deallocate(a) }.unwrap_err();
        assert_eq!(reason(&err), Some(InvalidBlockReason::OutsideArena));

        let copied_a = copy
            .state
            .lock()
            .arena
            .ptr_at(offset_of(&original, a) + OCCUPIED_OVERHEAD);
        assert_eq!(unsafe { copied_a.as_ptr().read() }, 0xA5);
        unsafe { copy.deallocate(copied_a) }.unwrap();
        assert_ne!(copy.blocks_info(), original.blocks_info());

        unsafe {
            original.deallocate(a).unwrap();
            original.deallocate(b).unwrap();
        }
        assert_eq!(original.blocks_info(), [free(0, 512)]);
    }

    #[test]
    fn test_copy_rejects_run_stamped_by_original() {
        let original = BuddyAllocator::new(256, FitMode::FirstFit).unwrap();
        let a = original.allocate(20).unwrap();
        let copy = original.clone();

        let start = offset_of(&original, a);
        let copied_a = {
            let mut state = copy.state.lock();
            let header = state.header(start);
            state.set_header(start, header.with_owner(original.owner()));
            state.arena.ptr_at(start + OCCUPIED_OVERHEAD)
        };
        let err = unsafe { copy.deallocate(copied_a) }.unwrap_err();
        assert_eq!(
            reason(&err),
            Some(InvalidBlockReason::OwnerMismatch {
                expected: copy.owner(),
                found: original.owner(),
            })
        );

        unsafe { original.deallocate(a) }.unwrap();
    }

    #[test]
    fn test_clone_from_reuses_compatible_arena() {
        let source = BuddyAllocator::new(256, FitMode::BestFit).unwrap();
        let ptr = source.allocate(20).unwrap();
        let mut target = BuddyAllocator::new(256, FitMode::FirstFit).unwrap();
        let target_base = target.state.lock().arena.base_addr();
        let target_owner = target.owner();

        target.clone_from(&source);
        assert_eq!(target.state.lock().arena.base_addr(), target_base);
        let restamped = target.owner();
        assert_ne!(restamped, target_owner);
        assert_ne!(restamped, source.owner());
        {
            let state = target.state.lock();
            for run in state.runs() {
                assert_eq!(state.header(run.offset).owner(), restamped);
            }
        }
        assert_eq!(target.blocks_info(), source.blocks_info());
        assert_eq!(target.fit_mode(), FitMode::BestFit);

        let copied = target.state.lock().arena.ptr_at(OCCUPIED_OVERHEAD);
        unsafe { target.deallocate(copied) }.unwrap();
        assert_eq!(target.blocks_info(), [free(0, 256)]);
        unsafe { source.deallocate(ptr) }.unwrap();
    }

    #[test]
    fn test_clone_from_replaces_incompatible_arena() {
        let source = BuddyAllocator::new(1024, FitMode::FirstFit).unwrap();
        let ptr = source.allocate(200).unwrap();
        let mut target = BuddyAllocator::new(64, FitMode::FirstFit).unwrap();

        target.clone_from(&source);
        assert_eq!(target.order(), 10);
        assert_eq!(target.capacity(), 1024);
        assert_eq!(target.blocks_info(), source.blocks_info());
        assert_ne!(target.owner(), source.owner());
        unsafe { source.deallocate(ptr) }.unwrap();
    }

    #[test]
    fn test_logger_receives_events() {
        let logger = Arc::new(RecordingLogger::default());
        let shared: Arc<RecordingLogger> = Arc::clone(&logger);
        let allocator =
            BuddyAllocator::new_in(64, Global, Some(shared), FitMode::FirstFit).unwrap();
        assert!(logger.contains(Severity::Information, "created with order 6"));

        let ptr = allocator.allocate(1).unwrap();
        assert!(logger.contains(Severity::Trace, "after 1 splits"));
        unsafe { allocator.deallocate(ptr) }.unwrap();
        assert!(logger.contains(Severity::Trace, "merged up to order 6"));

        let err = unsafe { allocator.deallocate(ptr) }.unwrap_err();
        assert!(err.is_double_free());
        assert!(logger.contains(Severity::Critical, "double free"));
        let err = allocator.allocate(1000).unwrap_err();
        assert!(err.is_out_of_memory());
        assert!(logger.contains(Severity::Warning, "out of memory"));

        let copy = allocator.clone();
        assert!(logger.contains(Severity::Debug, "cloned into"));
        drop(copy);
        assert!(logger.contains(Severity::Debug, "released with 0 bytes still in use"));
    }

    #[test]
    fn test_over_boundary_tag_upstream() {
        let outer = BoundaryTagAllocator::new(2048, FitMode::FirstFit).unwrap();
        {
            let buddy = BuddyAllocator::new_in(512, &outer, None, FitMode::FirstFit).unwrap();
            assert!(outer.used_bytes() >= 512);
            let ptr = buddy.allocate(64).unwrap();
            let copy = buddy.try_clone().unwrap();
            assert!(outer.used_bytes() >= 1024);
            assert_eq!(copy.blocks_info(), buddy.blocks_info());
            unsafe { buddy.deallocate(ptr) }.unwrap();
        }
        assert_eq!(outer.used_bytes(), 0);
    }

    #[test]
    fn test_clone_fails_when_upstream_is_exhausted() {
        let outer = BoundaryTagAllocator::new(700, FitMode::FirstFit).unwrap();
        let buddy = BuddyAllocator::new_in(512, &outer, None, FitMode::FirstFit).unwrap();
        let Err(err) = buddy.try_clone() else {
            panic!("cloning must fail once the upstream arena is exhausted");
        };
        assert!(err.is_out_of_memory());
    }
}
