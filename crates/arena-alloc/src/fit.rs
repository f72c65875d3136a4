//! Placement policies.

/// A region of an arena as seen by a block cursor.
///
/// `size` counts the region's header as well as its payload, so the sizes of
/// all regions of an arena add up to the arena size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    /// Offset of the region from the arena start.
    pub offset: usize,
    /// Size of the region in bytes, header included.
    pub size: usize,
    /// Whether the region is handed out to a caller.
    pub occupied: bool,
}

impl BlockInfo {
    pub(crate) const fn free(offset: usize, size: usize) -> Self {
        Self {
            offset,
            size,
            occupied: false,
        }
    }

    pub(crate) const fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Rule for choosing which free region serves a request.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    derive_more::Display,
    derive_more::IsVariant,
)]
pub enum FitMode {
    /// The first adequate free region in address order.
    #[default]
    #[display("first-fit")]
    FirstFit,
    /// The smallest adequate free region.
    #[display("best-fit")]
    BestFit,
    /// The largest adequate free region.
    #[display("worst-fit")]
    WorstFit,
}

impl FitMode {
    /// Selects a free candidate of at least `required` bytes.
    ///
    /// Occupied candidates are skipped. When several candidates tie under
    /// [`BestFit`](Self::BestFit) or [`WorstFit`](Self::WorstFit), the one
    /// seen first wins.
    pub fn select<I>(self, candidates: I, required: usize) -> Option<BlockInfo>
    where
        I: IntoIterator<Item = BlockInfo>,
    {
        let mut eligible = candidates
            .into_iter()
            .filter(|block| !block.occupied && block.size >= required);
        match self {
            Self::FirstFit => eligible.next(),
            Self::BestFit => eligible.reduce(|best, block| {
                if block.size < best.size { block } else { best }
            }),
            Self::WorstFit => eligible.reduce(|worst, block| {
                if block.size > worst.size { block } else { worst }
            }),
        }
    }
}
