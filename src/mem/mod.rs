pub mod host;
pub mod kmap;
pub mod region;
pub mod sg;

/// Cache coherency level programmed into GTT entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheLevel {
    /// Uncached (write-combined for CPU access).
    #[default]
    None,
    /// Snooped through the last level cache.
    Llc,
}

impl CacheLevel {
    /// Colour used for GTT placement; neighbouring nodes of different colour
    /// need a guard page between them.
    #[must_use]
    pub const fn color(self) -> u64 {
        match self {
            Self::None => 0,
            Self::Llc => 1,
        }
    }
}

pub use host::HostMemory;
pub use kmap::{KmapIter, move_memcpy};
pub use region::{MemoryRegion, RegionKind, RegionSet, Resource};
pub use sg::{SgEntry, SgTable};
