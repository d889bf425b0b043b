//! Two-level page table of an address space.
//!
//! Layout: `[pd index][pt index: 9 bits][offset: 12 bits]`. Page-table pages
//! are allocated on demand, or taken from a [`PtStash`] filled before the
//! address-space lock was taken so that asynchronous binds never allocate
//! from their worker.

use crate::mem::CacheLevel;
use crate::utils::{GTT_PAGE_SHIFT, GTT_PAGE_SIZE};
use bitflags::bitflags;
use std::collections::BTreeMap;

const PT_SHIFT: u32 = 9;
const PT_ENTRIES: usize = 1 << PT_SHIFT;

/// Bytes mapped by one page-table page.
pub const PT_SPAN: u64 = GTT_PAGE_SIZE << PT_SHIFT;

/// Bits 12 and up of an entry hold the page address.
pub const PTE_ADDR_MASK: u64 = !(GTT_PAGE_SIZE - 1);

/// Entry value for unmapped pages (points at nothing, not present).
pub const SCRATCH_PTE: u64 = 0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const RW      = 1 << 1;
        const LLC     = 1 << 4;
        const LM      = 1 << 11;
    }
}

impl PteFlags {
    /// Flags for a writable mapping at `level`, pointing into local memory if
    /// `lmem`.
    #[must_use]
    pub fn encode(level: CacheLevel, lmem: bool) -> Self {
        let mut flags = Self::PRESENT | Self::RW;
        if level == CacheLevel::Llc {
            flags |= Self::LLC;
        }
        if lmem {
            flags |= Self::LM;
        }
        flags
    }
}

type PtPage = Box<[u64; PT_ENTRIES]>;

fn new_pt() -> PtPage {
    Box::new([SCRATCH_PTE; PT_ENTRIES])
}

/// Page-table pages allocated ahead of an asynchronous bind.
#[derive(Debug, Default)]
pub struct PtStash {
    pages: Vec<PtPage>,
}

impl PtStash {
    /// Enough page-table pages to map `size` bytes anywhere in the address
    /// space.
    #[must_use]
    pub fn for_size(size: u64) -> Self {
        let count = usize::try_from(size.div_ceil(PT_SPAN) + 1).unwrap_or(usize::MAX);
        Self {
            pages: (0..count).map(|_| new_pt()).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PageTable {
    tables: BTreeMap<u64, PtPage>,
}

impl PageTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn pd_index(addr: u64) -> u64 {
        addr >> (GTT_PAGE_SHIFT + PT_SHIFT)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn pt_index(addr: u64) -> usize {
        ((addr >> GTT_PAGE_SHIFT) as usize) & (PT_ENTRIES - 1)
    }

    /// Makes sure page-table pages exist for `[start, start + size)`, taking
    /// them from `stash` first.
    pub fn allocate_va_range(&mut self, mut stash: Option<&mut PtStash>, start: u64, size: u64) {
        if size == 0 {
            return;
        }
        let first = Self::pd_index(start);
        let last = Self::pd_index(start + size - 1);
        for pd in first..=last {
            self.tables.entry(pd).or_insert_with(|| {
                stash
                    .as_deref_mut()
                    .and_then(|s| s.pages.pop())
                    .unwrap_or_else(new_pt)
            });
        }
    }

    /// Writes one entry per page address, starting at `start`. Zero
    /// addresses (padding) map to scratch.
    pub fn insert_entries(
        &mut self,
        start: u64,
        pages: impl Iterator<Item = u64>,
        flags: PteFlags,
    ) -> u64 {
        let mut addr = start;
        for dma in pages {
            let pte = if dma == 0 {
                SCRATCH_PTE
            } else {
                (dma & PTE_ADDR_MASK) | flags.bits()
            };
            let table = self
                .tables
                .entry(Self::pd_index(addr))
                .or_insert_with(new_pt);
            table[Self::pt_index(addr)] = pte;
            addr += GTT_PAGE_SIZE;
        }
        (addr - start) >> GTT_PAGE_SHIFT
    }

    /// Points `[start, start + size)` back at scratch, freeing page-table
    /// pages that become empty.
    pub fn clear_range(&mut self, start: u64, size: u64) {
        let mut addr = start;
        let end = start + size;
        while addr < end {
            let pd = Self::pd_index(addr);
            if let Some(table) = self.tables.get_mut(&pd) {
                table[Self::pt_index(addr)] = SCRATCH_PTE;
                if table.iter().all(|&pte| pte == SCRATCH_PTE) {
                    self.tables.remove(&pd);
                }
            }
            addr += GTT_PAGE_SIZE;
        }
    }

    #[must_use]
    pub fn pte(&self, addr: u64) -> u64 {
        self.tables
            .get(&Self::pd_index(addr))
            .map_or(SCRATCH_PTE, |t| t[Self::pt_index(addr)])
    }

    /// Bus address that `addr` maps to, if present.
    #[must_use]
    pub fn translate(&self, addr: u64) -> Option<u64> {
        let pte = self.pte(addr);
        if pte & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some((pte & PTE_ADDR_MASK) + (addr & (GTT_PAGE_SIZE - 1)))
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}
