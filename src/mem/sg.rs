use crate::utils::{GTT_PAGE_SHIFT, GTT_PAGE_SIZE};

/// Largest single segment emitted when describing contiguous memory.
pub const MAX_SEGMENT: u64 = 1 << 21;

/// One (bus address, length) segment. A zero address marks padding that is
/// mapped to the scratch page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub dma: u64,
    pub len: u64,
}

impl SgEntry {
    #[must_use]
    pub const fn is_padding(&self) -> bool {
        self.dma == 0
    }
}

/// Ordered list of segments describing non-contiguous backing memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgTable {
    entries: Vec<SgEntry>,
    total: u64,
}

impl SgTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(n: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n),
            total: 0,
        }
    }

    /// Describes `[dma, dma + len)` split into segments of at most `MAX_SEGMENT`.
    #[must_use]
    pub fn contiguous(dma: u64, len: u64) -> Self {
        let mut table = Self::with_capacity(len.div_ceil(MAX_SEGMENT) as usize);
        let mut offset = 0;
        while offset < len {
            let chunk = (len - offset).min(MAX_SEGMENT);
            table.push(dma + offset, chunk);
            offset += chunk;
        }
        table
    }

    pub fn push(&mut self, dma: u64, len: u64) {
        debug_assert!(len > 0 && len % GTT_PAGE_SIZE == 0);
        self.entries.push(SgEntry { dma, len });
        self.total += len;
    }

    pub fn push_padding(&mut self, len: u64) {
        self.push(0, len);
    }

    #[must_use]
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn num_pages(&self) -> u64 {
        self.total >> GTT_PAGE_SHIFT
    }

    /// Bus address of page `index`, `Some(0)` for padding.
    #[must_use]
    pub fn page_dma(&self, index: u64) -> Option<u64> {
        let mut offset = index << GTT_PAGE_SHIFT;
        for entry in &self.entries {
            if offset < entry.len {
                return Some(if entry.is_padding() {
                    0
                } else {
                    entry.dma + offset
                });
            }
            offset -= entry.len;
        }
        None
    }

    /// Bus address of each page in order.
    pub fn page_addrs(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().flat_map(|e| {
            (0..e.len >> GTT_PAGE_SHIFT).map(move |p| {
                if e.is_padding() {
                    0
                } else {
                    e.dma + (p << GTT_PAGE_SHIFT)
                }
            })
        })
    }

    /// The `count` pages starting at page `first`, as a new table.
    #[must_use]
    pub fn slice_pages(&self, first: u64, count: u64) -> Self {
        let mut out = Self::new();
        let mut skip = first << GTT_PAGE_SHIFT;
        let mut left = count << GTT_PAGE_SHIFT;

        for entry in &self.entries {
            if left == 0 {
                break;
            }
            if skip >= entry.len {
                skip -= entry.len;
                continue;
            }
            let len = (entry.len - skip).min(left);
            let dma = if entry.is_padding() { 0 } else { entry.dma + skip };
            out.push(dma, len);
            left -= len;
            skip = 0;
        }
        out
    }

    /// Merges physically adjacent segments.
    pub fn trim(&mut self) {
        let mut merged: Vec<SgEntry> = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if let Some(last) = merged.last_mut() {
                let adjacent = if last.is_padding() {
                    entry.is_padding()
                } else {
                    !entry.is_padding() && last.dma + last.len == entry.dma
                };
                if adjacent && last.len + entry.len <= MAX_SEGMENT {
                    last.len += entry.len;
                    continue;
                }
            }
            merged.push(entry);
        }
        self.entries = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_splits_segments() {
        let table = SgTable::contiguous(0x10_0000, MAX_SEGMENT + 2 * GTT_PAGE_SIZE);
        assert_eq!(table.entries().len(), 2);
        assert_eq!(table.num_pages(), (MAX_SEGMENT >> GTT_PAGE_SHIFT) + 2);
        assert_eq!(
            table.page_dma(MAX_SEGMENT >> GTT_PAGE_SHIFT),
            Some(0x10_0000 + MAX_SEGMENT)
        );
    }

    #[test]
    fn test_slice_pages_and_padding() {
        let mut table = SgTable::new();
        table.push(0x1000, 2 * GTT_PAGE_SIZE);
        table.push_padding(GTT_PAGE_SIZE);
        table.push(0x9000, GTT_PAGE_SIZE);

        let addrs: Vec<u64> = table.page_addrs().collect();
        assert_eq!(addrs, vec![0x1000, 0x2000, 0, 0x9000]);

        let slice = table.slice_pages(1, 2);
        assert_eq!(slice.page_addrs().collect::<Vec<_>>(), vec![0x2000, 0]);
        assert_eq!(table.page_dma(4), None);
    }

    #[test]
    fn test_trim_merges_adjacent() {
        let mut table = SgTable::new();
        table.push(0x1000, GTT_PAGE_SIZE);
        table.push(0x2000, GTT_PAGE_SIZE);
        table.push(0x8000, GTT_PAGE_SIZE);
        table.trim();
        assert_eq!(table.entries().len(), 2);
        assert_eq!(table.num_pages(), 3);
    }
}
