//! Owner tags stamped into every block header.
//!
//! An owner id identifies which allocator instance created a block. It is a
//! weak tag, compared on deallocation to reject pointers that belong to a
//! different arena. Ids are 24 bits wide so that they fit next to the order
//! and occupancy bits of a packed buddy run header.
//!
//! Generation is pseudo-random and best-effort: two live allocators may draw
//! the same id, and nothing checks for it.

use core::sync::atomic::{AtomicUsize, Ordering};

use platform_cast::CastFrom as _;

/// A 24-bit allocator owner id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{_0:#08x}")]
pub struct OwnerId(u32);

const _: () = assert!(OwnerId::MASK.count_ones() == OwnerId::BITS);

static SEQUENCE: AtomicUsize = AtomicUsize::new(0);

impl OwnerId {
    /// Width of an owner id in bits.
    pub const BITS: u32 = 24;

    const MASK: u32 = (1 << Self::BITS) - 1;

    /// Builds an owner id from raw bits, discarding bits above [`Self::BITS`].
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::MASK)
    }

    /// Returns the raw bits of this id.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Draws a fresh id.
    ///
    /// `seed` is mixed into the draw (callers pass the arena address) so that
    /// ids differ across processes as well as across instances. The result is
    /// never zero, which keeps zero-filled arena bytes from ever matching.
    pub(crate) fn generate(seed: usize) -> Self {
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let mixed = splitmix64(u64::cast_from(sequence) ^ u64::cast_from(seed).rotate_left(29));
        let folded = (mixed ^ (mixed >> 24) ^ (mixed >> 48)) & u64::from(Self::MASK);
        match u32::try_from(folded).unwrap_or_default() {
            0 => Self(1),
            bits => Self(bits),
        }
    }
}

fn splitmix64(value: u64) -> u64 {
    let mut z = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
