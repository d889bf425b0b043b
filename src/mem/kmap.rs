#![allow(clippy::cast_possible_truncation)]

use super::host::HostMemory;
use super::region::MemoryRegion;
use super::sg::SgTable;
use crate::error::{VmaError, VmaResult};
use crate::utils::{GTT_PAGE_SHIFT, GTT_PAGE_SIZE};
use std::sync::Arc;

/// Page-by-page CPU view of a resource, hiding whether the pages are plain
/// system memory or reached through an io mapping.
pub trait KmapIter: Send + Sync {
    /// CPU pointer to the start of page `index`, `None` past the end.
    fn page_ptr(&self, index: u64) -> Option<*mut u8>;

    fn num_pages(&self) -> u64;
}

/// Iterator over populated system pages.
pub struct TtIter {
    mem: Arc<HostMemory>,
}

impl TtIter {
    #[must_use]
    pub fn new(mem: Arc<HostMemory>) -> Self {
        Self { mem }
    }
}

impl KmapIter for TtIter {
    fn page_ptr(&self, index: u64) -> Option<*mut u8> {
        let offset = index.checked_mul(GTT_PAGE_SIZE)? as usize;
        if offset >= self.mem.len() {
            return None;
        }
        Some(unsafe { self.mem.as_ptr().add(offset) })
    }

    fn num_pages(&self) -> u64 {
        self.mem.len() as u64 >> GTT_PAGE_SHIFT
    }
}

/// Iterator over local memory, resolving each page through the region's io
/// mapping.
pub struct IoMapIter {
    region: Arc<MemoryRegion>,
    sg: Arc<SgTable>,
}

impl IoMapIter {
    #[must_use]
    pub fn new(region: Arc<MemoryRegion>, sg: Arc<SgTable>) -> Self {
        Self { region, sg }
    }
}

impl KmapIter for IoMapIter {
    fn page_ptr(&self, index: u64) -> Option<*mut u8> {
        let dma = self.sg.page_dma(index)?;
        self.region.io_ptr(dma, GTT_PAGE_SIZE)
    }

    fn num_pages(&self) -> u64 {
        self.sg.num_pages()
    }
}

/// CPU copy of `num_pages` pages from `src` to `dst`, or a zero fill of `dst`
/// when `clear` is set or there is no source.
///
/// # Errors
/// `InvalidArgument` if either side has fewer than `num_pages` pages.
pub fn move_memcpy(
    clear: bool,
    num_pages: u64,
    dst: &dyn KmapIter,
    src: Option<&dyn KmapIter>,
) -> VmaResult<()> {
    let page = GTT_PAGE_SIZE as usize;
    for i in 0..num_pages {
        let d = dst
            .page_ptr(i)
            .ok_or_else(|| VmaError::InvalidArgument(format!("dst page {i} out of range")))?;

        match src {
            Some(src) if !clear => {
                let s = src.page_ptr(i).ok_or_else(|| {
                    VmaError::InvalidArgument(format!("src page {i} out of range"))
                })?;
                unsafe { std::ptr::copy_nonoverlapping(s, d, page) };
            }
            _ => unsafe { std::ptr::write_bytes(d, 0, page) },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::region::Resource;

    fn fill(iter: &dyn KmapIter, byte: u8) {
        for i in 0..iter.num_pages() {
            let p = iter.page_ptr(i).unwrap();
            unsafe { std::ptr::write_bytes(p, byte.wrapping_add(i as u8), GTT_PAGE_SIZE as usize) };
        }
    }

    fn page_byte(iter: &dyn KmapIter, index: u64) -> u8 {
        unsafe { *iter.page_ptr(index).unwrap().add(17) }
    }

    #[test]
    fn test_copy_system_to_local() {
        let system = MemoryRegion::system(0);
        let local = MemoryRegion::local(1, 0, 8 * GTT_PAGE_SIZE).unwrap();
        let src = Resource::new(&system, 4 * GTT_PAGE_SIZE).unwrap();
        src.populate().unwrap();
        let dst = Resource::new(&local, 4 * GTT_PAGE_SIZE).unwrap();

        let src_iter = src.kmap_iter().unwrap();
        let dst_iter = dst.kmap_iter().unwrap();
        fill(src_iter.as_ref(), 0x40);

        move_memcpy(false, 4, dst_iter.as_ref(), Some(src_iter.as_ref())).unwrap();
        for i in 0..4 {
            assert_eq!(page_byte(dst_iter.as_ref(), i), 0x40 + i as u8);
        }
    }

    #[test]
    fn test_clear_ignores_source() {
        let system = MemoryRegion::system(0);
        let dst = Resource::new(&system, 2 * GTT_PAGE_SIZE).unwrap();
        dst.populate().unwrap();
        let iter = dst.kmap_iter().unwrap();
        fill(iter.as_ref(), 0xff);

        move_memcpy(true, 2, iter.as_ref(), None).unwrap();
        assert_eq!(page_byte(iter.as_ref(), 0), 0);
        assert_eq!(page_byte(iter.as_ref(), 1), 0);
    }

    #[test]
    fn test_short_destination_rejected() {
        let system = MemoryRegion::system(0);
        let dst = Resource::new(&system, GTT_PAGE_SIZE).unwrap();
        dst.populate().unwrap();
        let iter = dst.kmap_iter().unwrap();
        assert!(matches!(
            move_memcpy(true, 2, iter.as_ref(), None),
            Err(VmaError::InvalidArgument(_))
        ));
    }
}
