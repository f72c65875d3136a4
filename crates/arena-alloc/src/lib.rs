//! Fixed-arena memory allocators.
//!
//! Each allocator in this crate acquires one contiguous arena up front, from
//! the process allocator or from any other [`MemoryResource`], and serves
//! variable-size requests out of it until it is dropped. Allocators are
//! internally locked and can be shared between threads.
//!
//! # Available Allocators
//!
//! ## [`BoundaryTagAllocator`]
//!
//! A free-list allocator that cuts the arena into variable-size spans with a
//! header in front of each. Best suited for:
//!
//! - Variable-sized allocations with little rounding waste
//! - Workloads whose freed blocks are reused at similar sizes
//!
//! Freed spans are never coalesced, so the arena fragments over time.
//!
//! ## [`BuddyAllocator`]
//!
//! A binary buddy allocator over a power-of-two arena. Requests are rounded up
//! to a power of two, and freed runs merge with their buddies. It detects
//! double frees and can be cloned together with its contents.
//!
//! Both implement [`ArenaAllocator`], and both accept a [`FitMode`] choosing
//! between first-fit, best-fit and worst-fit placement.
//!
//! # Usage
//!
//! ```rust
//! use arena_alloc::{BoundaryTagAllocator, BuddyAllocator, FitMode};
//!
//! let heap = BoundaryTagAllocator::new(8192, FitMode::BestFit)?;
//! let ptr = heap.allocate(100)?;
//! unsafe { heap.deallocate(ptr)? };
//!
//! // A buddy allocator whose arena is carved out of `heap`.
//! let buddy = BuddyAllocator::new_in(1024, &heap, None, FitMode::FirstFit)?;
//! let ptr = buddy.allocate(10)?;
//! unsafe { buddy.deallocate(ptr)? };
//! # Ok::<(), arena_alloc::AllocError>(())
//! ```
//!
//! # Performance Characteristics
//!
//! | Allocator | Allocation | Deallocation | Overhead per block |
//! |-----------|------------|--------------|--------------------|
//! | `BoundaryTagAllocator` | O(free spans) | O(free spans) | `SPAN_HEADER_SIZE` |
//! | `BuddyAllocator` | O(runs) | O(k) | `OCCUPIED_OVERHEAD` plus rounding |

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

#[macro_use]
mod log;

mod arena;
pub mod boundary_tag;
pub mod buddy;
pub mod error;
pub mod fit;
pub mod owner;
pub mod resource;

use alloc::vec::Vec;
use core::ptr::NonNull;

pub use self::{
    arena::ARENA_ALIGN,
    boundary_tag::BoundaryTagAllocator,
    buddy::BuddyAllocator,
    error::{AllocError, ConfigurationReason, ErrorKind, InvalidBlockReason, Location},
    fit::{BlockInfo, FitMode},
    log::{Logger, MinSeverity, Severity, SharedLogger},
    owner::OwnerId,
    resource::{Global, MemoryResource},
};

/// Operations shared by every arena allocator.
pub trait ArenaAllocator {
    /// Allocates `size` bytes aligned to [`ARENA_ALIGN`].
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Returns a block previously handed out by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this allocator and not
    /// been deallocated since, or must point outside this allocator's arena.
    /// Implementations may detect some violations, but are not required to.
    unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), AllocError>;

    fn set_fit_mode(&self, fit_mode: FitMode);

    fn fit_mode(&self) -> FitMode;

    /// Lists every block of the arena in address order.
    ///
    /// The block sizes add up to [`capacity`](Self::capacity).
    fn blocks_info(&self) -> Vec<BlockInfo>;

    /// Size of the arena in bytes.
    fn capacity(&self) -> usize;

    /// Bytes held by occupied blocks, per-block metadata included.
    fn used_bytes(&self) -> usize;

    fn available_bytes(&self) -> usize {
        self.capacity() - self.used_bytes()
    }
}
