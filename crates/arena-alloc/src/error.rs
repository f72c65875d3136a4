//! Error type shared by every allocator in this crate.

use core::fmt;

use snafu::{GenerateImplicitData, Snafu};

use crate::owner::OwnerId;

/// Source location where an [`AllocError`] was raised.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl Location {
    /// Returns the underlying caller location.
    #[must_use]
    pub fn get(&self) -> &'static core::panic::Location<'static> {
        self.0
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Why a pointer passed to `deallocate` was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[non_exhaustive]
pub enum InvalidBlockReason {
    #[display("pointer does not belong to this arena")]
    OutsideArena,
    #[display("pointer is not aligned to a block boundary")]
    Misaligned,
    #[display("back-reference word points to offset {found:#x}")]
    BackReferenceMismatch { found: usize },
    #[display("owner tag mismatch: expected={expected}, found={found}")]
    OwnerMismatch { expected: OwnerId, found: OwnerId },
    #[display("block header is corrupt")]
    CorruptHeader,
}

/// Why an allocator could not be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[non_exhaustive]
pub enum ConfigurationReason {
    #[display("capacity {capacity} is smaller than the minimum of {minimum} bytes")]
    CapacityTooSmall { capacity: usize, minimum: usize },
    #[display("arena order {order} is below the minimum order {minimum}")]
    OrderTooSmall { order: u32, minimum: u32 },
    #[display("requested arena size {requested} is too large")]
    CapacityTooLarge { requested: usize },
}

/// Coarse classification of an [`AllocError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ErrorKind {
    OutOfMemory,
    InvalidBlock,
    DoubleFree,
    Configuration,
}

/// Errors returned by arena allocators.
#[derive(Debug, Snafu, derive_more::IsVariant)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum AllocError {
    #[snafu(display("out of memory: no free region can hold {requested} bytes"))]
    OutOfMemory {
        requested: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid block at {address:#x}: {reason}"))]
    InvalidBlock {
        address: usize,
        reason: InvalidBlockReason,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("double free of block at {address:#x}"))]
    DoubleFree {
        address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid arena configuration: {reason}"))]
    Configuration {
        reason: ConfigurationReason,
        #[snafu(implicit)]
        location: Location,
    },
}

impl AllocError {
    /// Returns the kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::InvalidBlock { .. } => ErrorKind::InvalidBlock,
            Self::DoubleFree { .. } => ErrorKind::DoubleFree,
            Self::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// Returns the location where this error was raised.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::OutOfMemory { location, .. }
            | Self::InvalidBlock { location, .. }
            | Self::DoubleFree { location, .. }
            | Self::Configuration { location, .. } => *location,
        }
    }
}
