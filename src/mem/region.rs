#![allow(clippy::cast_possible_truncation)]

use super::host::HostMemory;
use super::kmap::{IoMapIter, KmapIter, TtIter};
use super::sg::SgTable;
use super::CacheLevel;
use crate::error::{VmaError, VmaResult};
use crate::gtt::range::RangeManager;
use crate::utils::{GTT_PAGE_SIZE, align_up};
use parking_lot::Mutex;
use std::sync::Arc;

/// Bus address where device-local memory starts. Sits above every canonical
/// user-space address so that it never aliases a system page.
pub const LMEM_BUS_BASE: u64 = 1 << 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Cached system pages, directly addressable by the CPU.
    System,
    /// Device-local memory, reachable by the CPU only through an io mapping.
    Local,
}

/// A memory region objects can be placed in.
#[derive(Debug)]
pub struct MemoryRegion {
    id: u32,
    kind: RegionKind,
    instance: u16,
    name: String,
    /// Bus address of the first byte (local memory only).
    start: u64,
    size: u64,
    /// CPU view of local memory.
    iomem: Option<HostMemory>,
    /// Allocator for local memory.
    mm: Mutex<RangeManager>,
}

impl MemoryRegion {
    /// System memory: unbounded in principle, `size` only caps accounting.
    #[must_use]
    pub fn system(id: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind: RegionKind::System,
            instance: 0,
            name: "system".to_string(),
            start: 0,
            size: u64::MAX,
            iomem: None,
            mm: Mutex::new(RangeManager::new(0, 0)),
        })
    }

    /// Device-local memory of `size` bytes, backed by a host mapping that
    /// plays the role of the io aperture.
    ///
    /// # Errors
    /// Fails if the backing mapping cannot be created.
    pub fn local(id: u32, instance: u16, size: u64) -> VmaResult<Arc<Self>> {
        let size = align_up(size, GTT_PAGE_SIZE);
        let start = LMEM_BUS_BASE + u64::from(instance) * (1 << 40);
        let iomem = HostMemory::map(size as usize)?;
        Ok(Arc::new(Self {
            id,
            kind: RegionKind::Local,
            instance,
            name: format!("local{instance}"),
            start,
            size,
            iomem: Some(iomem),
            mm: Mutex::new(RangeManager::new(0, size)),
        }))
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    #[must_use]
    pub fn instance(&self) -> u16 {
        self.instance
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.kind == RegionKind::Local
    }

    /// Bytes still available for allocation (local memory only).
    #[must_use]
    pub fn available(&self) -> u64 {
        match self.kind {
            RegionKind::System => u64::MAX,
            RegionKind::Local => self.size - self.mm.lock().allocated_bytes(),
        }
    }

    /// CPU pointer for bus address range `[dma, dma + len)` in this region.
    #[must_use]
    pub fn io_ptr(&self, dma: u64, len: u64) -> Option<*mut u8> {
        let iomem = self.iomem.as_ref()?;
        if dma < self.start || dma.checked_add(len)? > self.start + self.size {
            return None;
        }
        let offset = (dma - self.start) as usize;
        Some(unsafe { iomem.as_ptr().add(offset) })
    }

    fn alloc_local(&self, size: u64) -> VmaResult<u64> {
        let mut mm = self.mm.lock();
        let end = mm.end();
        mm.insert_best_fit(size, GTT_PAGE_SIZE, 0, 0, end)
            .map(|node| node.start)
    }

    fn free_local(&self, offset: u64) {
        if self.mm.lock().remove(offset).is_none() {
            log::warn!("{}: freeing untracked offset 0x{offset:x}", self.name);
        }
    }
}

/// Every region of a device, used to turn bus addresses back into CPU
/// pointers when the CPU or the software copy engine touches memory.
#[derive(Debug, Default)]
pub struct RegionSet {
    regions: Vec<Arc<MemoryRegion>>,
}

impl RegionSet {
    #[must_use]
    pub fn new(regions: Vec<Arc<MemoryRegion>>) -> Self {
        Self { regions }
    }

    #[must_use]
    pub fn regions(&self) -> &[Arc<MemoryRegion>] {
        &self.regions
    }

    #[must_use]
    pub fn by_id(&self, id: u32) -> Option<&Arc<MemoryRegion>> {
        self.regions.iter().find(|r| r.id() == id)
    }

    /// CPU pointer for a bus address range. System pages are identity mapped.
    #[must_use]
    pub fn dma_to_host(&self, dma: u64, len: u64) -> Option<*mut u8> {
        if dma == 0 {
            return None;
        }
        if dma >= LMEM_BUS_BASE {
            return self
                .regions
                .iter()
                .filter(|r| r.is_local())
                .find_map(|r| r.io_ptr(dma, len));
        }
        Some(dma as *mut u8)
    }
}

enum Store {
    /// System pages, allocated on first populate.
    Tt(Mutex<Option<Arc<HostMemory>>>),
    /// Offset of the allocation inside a local region.
    Local(u64),
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tt(pages) => write!(f, "Tt(populated: {})", pages.lock().is_some()),
            Self::Local(offset) => write!(f, "Local(0x{offset:x})"),
        }
    }
}

/// A concrete placement of a buffer's contents in one region.
#[derive(Debug)]
pub struct Resource {
    region: Arc<MemoryRegion>,
    size: u64,
    store: Store,
    sg: Mutex<Option<Arc<SgTable>>>,
}

impl Resource {
    /// Reserves `size` bytes in `region`. Local memory is allocated now,
    /// system pages only when populated.
    ///
    /// # Errors
    /// `NoSpace` if local memory is exhausted.
    pub fn new(region: &Arc<MemoryRegion>, size: u64) -> VmaResult<Arc<Self>> {
        let size = align_up(size, GTT_PAGE_SIZE);
        let store = match region.kind() {
            RegionKind::System => Store::Tt(Mutex::new(None)),
            RegionKind::Local => Store::Local(region.alloc_local(size)?),
        };
        Ok(Arc::new(Self {
            region: region.clone(),
            size,
            store,
            sg: Mutex::new(None),
        }))
    }

    #[must_use]
    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn num_pages(&self) -> u64 {
        self.size / GTT_PAGE_SIZE
    }

    /// The CPU reaches this resource through an io mapping.
    #[must_use]
    pub fn cpu_maps_iomem(&self) -> bool {
        matches!(self.store, Store::Local(_))
    }

    /// GTT entries for this resource point at local memory.
    #[must_use]
    pub fn gtt_binds_lmem(&self) -> bool {
        self.region.is_local()
    }

    /// Whether CPU access goes through the cache.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        !self.cpu_maps_iomem()
    }

    #[must_use]
    pub fn cache_level(&self, has_llc: bool) -> CacheLevel {
        if has_llc && !self.gtt_binds_lmem() && self.is_cached() {
            CacheLevel::Llc
        } else {
            CacheLevel::None
        }
    }

    /// Whether the resource holds (possibly zero) pages.
    #[must_use]
    pub fn is_populated(&self) -> bool {
        match &self.store {
            Store::Tt(pages) => pages.lock().is_some(),
            Store::Local(_) => true,
        }
    }

    /// Allocates system pages if not done yet.
    ///
    /// # Errors
    /// Propagates host mapping failures.
    pub fn populate(&self) -> VmaResult<()> {
        if let Store::Tt(pages) = &self.store {
            let mut pages = pages.lock();
            if pages.is_none() {
                *pages = Some(Arc::new(HostMemory::map(self.size as usize)?));
            }
        }
        Ok(())
    }

    /// Scatter list of the resource. System pages must be populated.
    ///
    /// # Errors
    /// `InvalidArgument` if the system pages were never populated.
    pub fn sg_table(&self) -> VmaResult<Arc<SgTable>> {
        let mut cached = self.sg.lock();
        if let Some(sg) = cached.as_ref() {
            return Ok(sg.clone());
        }

        let sg = match &self.store {
            Store::Tt(pages) => {
                let pages = pages.lock();
                let mem = pages.as_ref().ok_or_else(|| {
                    VmaError::InvalidArgument("resource pages not populated".into())
                })?;
                SgTable::contiguous(mem.addr(), self.size)
            }
            Store::Local(offset) => SgTable::contiguous(self.region.start() + offset, self.size),
        };

        let sg = Arc::new(sg);
        *cached = Some(sg.clone());
        Ok(sg)
    }

    /// Page iterator for CPU copies.
    ///
    /// # Errors
    /// `InvalidArgument` if the system pages were never populated.
    pub fn kmap_iter(&self) -> VmaResult<Box<dyn KmapIter>> {
        match &self.store {
            Store::Tt(pages) => {
                let mem = pages.lock().clone().ok_or_else(|| {
                    VmaError::InvalidArgument("resource pages not populated".into())
                })?;
                Ok(Box::new(TtIter::new(mem)))
            }
            Store::Local(_) => Ok(Box::new(IoMapIter::new(
                self.region.clone(),
                self.sg_table()?,
            ))),
        }
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        if let Store::Local(offset) = self.store {
            self.region.free_local(offset);
        }
    }
}
