//! Buffer objects.
//!
//! A [`BufferObject`] owns the current placement of its contents (a
//! [`Resource`] in one memory region) and everything derived from it. That
//! state is guarded by the object lock ([`BufferObject::lock`]), which ranks
//! above the address-space lock. The VMA registry has its own short lock and
//! the page pin count is atomic, so unbinding never needs the object lock.

#![allow(clippy::cast_possible_truncation)]

use crate::context::Gt;
use crate::error::{VmaError, VmaResult};
use crate::fence::{Fence, OperationCtx, ReservationObject};
use crate::mem::{CacheLevel, MemoryRegion, Resource, SgTable};
use crate::utils::{GTT_PAGE_SIZE, align_up};
use crate::vma::registry::VmaList;
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ObjectFlags: u32 {
        /// Fresh backing must read back as zero, so moving an unpopulated
        /// object still clears the destination.
        const ZERO_ALLOC = 1 << 0;
    }

    /// Read/write domains of the CPU view.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Domains: u32 {
        const CPU = 1 << 0;
        const GTT = 1 << 1;
        const WC  = 1 << 2;
    }

    /// How the CPU reaches the backing pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemFlags: u32 {
        const STRUCT_PAGE = 1 << 0;
        const IOMEM       = 1 << 1;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UnbindFlags: u32 {
        /// Also unbind VMAs still in use by the GPU.
        const ACTIVE  = 1 << 0;
        /// Do not wait for the page-table clears.
        const ASYNC   = 1 << 1;
        /// Give up with `Busy` on a contended address-space lock.
        const TRYLOCK = 1 << 2;
    }
}

/// Retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Madvise {
    #[default]
    WillNeed,
    /// Contents may be discarded under pressure or on the next move.
    DontNeed,
    /// Contents were discarded.
    Purged,
}

/// Placement state, guarded by the object lock.
#[derive(Debug)]
pub struct ObjectState {
    pub(crate) resource: Arc<Resource>,
    pub(crate) region: Arc<MemoryRegion>,
    pub(crate) pages: Option<Arc<SgTable>>,
    pub(crate) madv: Madvise,
    pub(crate) read_domains: Domains,
    pub(crate) write_domain: Domains,
    pub(crate) mem_flags: MemFlags,
    pub(crate) cache_level: CacheLevel,
    /// Fence of the last migration, until it signals.
    pub(crate) moving: Option<Fence>,
    /// Scatter list kept for io access to local memory.
    pub(crate) cached_io_sgt: Option<Arc<SgTable>>,
}

impl ObjectState {
    #[must_use]
    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    #[must_use]
    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    #[must_use]
    pub fn madv(&self) -> Madvise {
        self.madv
    }

    #[must_use]
    pub fn moving(&self) -> Option<&Fence> {
        self.moving.as_ref().filter(|f| !f.is_signaled())
    }

    #[must_use]
    pub fn has_pages(&self) -> bool {
        self.pages.is_some()
    }
}

pub type ObjectGuard<'a> = MutexGuard<'a, ObjectState>;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

pub struct BufferObject {
    id: u64,
    size: u64,
    flags: ObjectFlags,
    gt: Arc<Gt>,
    placements: Vec<Arc<MemoryRegion>>,
    resv: ReservationObject,
    state: Mutex<ObjectState>,
    pages_pin: AtomicU32,
    pub(crate) vmas: RwLock<VmaList>,
}

impl std::fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferObject")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("pages_pin", &self.pages_pin.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BufferObject {
    pub(crate) fn new(
        gt: Arc<Gt>,
        size: u64,
        placements: &[Arc<MemoryRegion>],
        flags: ObjectFlags,
    ) -> VmaResult<Arc<Self>> {
        if size == 0 {
            return Err(VmaError::InvalidArgument("zero sized object".into()));
        }
        let Some(region) = placements.first() else {
            return Err(VmaError::InvalidArgument("object without placements".into()));
        };

        let size = align_up(size, GTT_PAGE_SIZE);
        let resource = Resource::new(region, size)?;
        let state = ObjectState {
            mem_flags: mem_flags_for(&resource),
            cache_level: resource.cache_level(gt.has_llc()),
            read_domains: domains_for(&resource),
            write_domain: domains_for(&resource),
            cached_io_sgt: None,
            resource,
            region: region.clone(),
            pages: None,
            madv: Madvise::WillNeed,
            moving: None,
        };

        Ok(Arc::new(Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            size,
            flags,
            gt,
            placements: placements.to_vec(),
            resv: ReservationObject::new(),
            state: Mutex::new(state),
            pages_pin: AtomicU32::new(0),
            vmas: RwLock::new(VmaList::default()),
        }))
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn num_pages(&self) -> u64 {
        self.size / GTT_PAGE_SIZE
    }

    #[must_use]
    pub fn flags(&self) -> ObjectFlags {
        self.flags
    }

    #[must_use]
    pub fn gt(&self) -> &Arc<Gt> {
        &self.gt
    }

    #[must_use]
    pub fn placements(&self) -> &[Arc<MemoryRegion>] {
        &self.placements
    }

    #[must_use]
    pub fn resv(&self) -> &ReservationObject {
        &self.resv
    }

    /// Takes the object lock.
    pub fn lock(&self) -> ObjectGuard<'_> {
        self.state.lock()
    }

    pub fn try_lock(&self) -> Option<ObjectGuard<'_>> {
        self.state.try_lock()
    }

    #[must_use]
    pub fn region(&self) -> Arc<MemoryRegion> {
        self.lock().region.clone()
    }

    #[must_use]
    pub fn resource(&self) -> Arc<Resource> {
        self.lock().resource.clone()
    }

    #[must_use]
    pub fn is_lmem(&self) -> bool {
        self.lock().resource.gtt_binds_lmem()
    }

    #[must_use]
    pub fn madv(&self) -> Madvise {
        self.lock().madv
    }

    /// Sets the retention policy. Purged objects stay purged.
    pub fn set_madv(&self, madv: Madvise) -> Madvise {
        let mut st = self.lock();
        if st.madv != Madvise::Purged {
            st.madv = madv;
        }
        st.madv
    }

    #[must_use]
    pub fn mem_flags(&self) -> MemFlags {
        self.lock().mem_flags
    }

    #[must_use]
    pub fn cache_level(&self) -> CacheLevel {
        self.lock().cache_level
    }

    /// `(read_domains, write_domain)`.
    #[must_use]
    pub fn domains(&self) -> (Domains, Domains) {
        let st = self.lock();
        (st.read_domains, st.write_domain)
    }

    pub(crate) fn set_write_domain(&self, domain: Domains) {
        let mut st = self.lock();
        st.write_domain = domain;
        st.read_domains |= domain;
    }

    /// Fence of a migration still in flight.
    #[must_use]
    pub fn moving_fence(&self) -> Option<Fence> {
        self.lock().moving().cloned()
    }

    #[must_use]
    pub fn cached_io_sgt(&self) -> Option<Arc<SgTable>> {
        self.lock().cached_io_sgt.clone()
    }

    #[must_use]
    pub fn pages_pin_count(&self) -> u32 {
        self.pages_pin.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn has_pages(&self) -> bool {
        self.lock().pages.is_some()
    }

    /// Acquires the backing pages, populating them on first use, and pins
    /// them against [`put_pages`](Self::put_pages).
    ///
    /// # Errors
    /// Propagates population failures.
    pub fn pin_pages(&self) -> VmaResult<Arc<SgTable>> {
        let mut st = self.lock();
        if st.madv == Madvise::Purged {
            return Err(VmaError::InvalidArgument(format!(
                "object {} was purged",
                self.id
            )));
        }
        let pages = match &st.pages {
            Some(pages) => pages.clone(),
            None => {
                st.resource.populate()?;
                let pages = st.resource.sg_table()?;
                st.pages = Some(pages.clone());
                pages
            }
        };
        self.pages_pin.fetch_add(1, Ordering::AcqRel);
        Ok(pages)
    }

    pub fn unpin_pages(&self) {
        let prev = self.pages_pin.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "object {} pages unpinned too often", self.id);
    }

    /// Drops the page list.
    ///
    /// # Errors
    /// `Busy` while the pages are pinned.
    pub fn put_pages(&self) -> VmaResult<()> {
        let mut st = self.lock();
        self.put_pages_locked(&mut st)
    }

    pub(crate) fn put_pages_locked(&self, st: &mut ObjectState) -> VmaResult<()> {
        if self.pages_pin_count() > 0 {
            return Err(VmaError::Busy);
        }
        st.pages = None;
        Ok(())
    }

    /// Removes VMAs of this object from their address spaces.
    ///
    /// # Errors
    /// `Busy` if a VMA is pinned, or active without `ACTIVE`; otherwise the
    /// first unbind error.
    pub fn unbind(&self, flags: UnbindFlags, ctx: &OperationCtx) -> VmaResult<()> {
        let vmas = self.vmas();
        for vma in &vmas {
            if vma.node().is_none() {
                continue;
            }
            if vma.is_pinned() {
                return Err(VmaError::Busy);
            }
            if !flags.contains(UnbindFlags::ACTIVE) && vma.is_active() {
                return Err(VmaError::Busy);
            }

            if flags.contains(UnbindFlags::ASYNC) {
                vma.unbind_async(flags.contains(UnbindFlags::TRYLOCK))?;
            } else {
                vma.unbind(ctx)?;
            }
        }
        Ok(())
    }

    /// Waits for all GPU access to finish.
    ///
    /// # Errors
    /// Returns the first fence error or `Interrupted`.
    pub fn wait_idle(&self, ctx: &OperationCtx) -> VmaResult<()> {
        self.resv.wait(true, ctx)
    }

    /// Reads through the CPU view after the last writer finishes.
    ///
    /// # Errors
    /// `InvalidArgument` if the range lies outside the object, or the error
    /// of the last writer.
    pub fn cpu_read(&self, offset: u64, buf: &mut [u8]) -> VmaResult<()> {
        self.resv.wait(false, &OperationCtx::new())?;
        self.cpu_access(offset, buf.len() as u64, |ptr, at, len| unsafe {
            std::ptr::copy_nonoverlapping(ptr, buf[at..at + len].as_mut_ptr(), len);
        })
    }

    /// Writes through the CPU view after all GPU access finishes.
    ///
    /// # Errors
    /// `InvalidArgument` if the range lies outside the object, or the error
    /// of a pending access.
    pub fn cpu_write(&self, offset: u64, data: &[u8]) -> VmaResult<()> {
        self.resv.wait(true, &OperationCtx::new())?;
        self.cpu_access(offset, data.len() as u64, |ptr, at, len| unsafe {
            std::ptr::copy_nonoverlapping(data[at..at + len].as_ptr(), ptr, len);
        })?;
        self.set_write_domain(Domains::CPU);
        Ok(())
    }

    fn cpu_access(
        &self,
        offset: u64,
        len: u64,
        mut f: impl FnMut(*mut u8, usize, usize),
    ) -> VmaResult<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(VmaError::InvalidArgument(format!(
                "cpu access 0x{offset:x}+0x{len:x} outside object"
            )));
        }

        let st = self.lock();
        st.resource.populate()?;
        let iter = st.resource.kmap_iter()?;

        let mut done = 0u64;
        while done < len {
            let pos = offset + done;
            let page = pos / GTT_PAGE_SIZE;
            let in_page = pos % GTT_PAGE_SIZE;
            let chunk = (GTT_PAGE_SIZE - in_page).min(len - done);
            let base = iter.page_ptr(page).ok_or_else(|| {
                VmaError::InvalidArgument(format!("page {page} not mapped"))
            })?;
            f(
                unsafe { base.add(in_page as usize) },
                done as usize,
                chunk as usize,
            );
            done += chunk;
        }
        Ok(())
    }
}

pub(crate) fn mem_flags_for(resource: &Resource) -> MemFlags {
    if resource.cpu_maps_iomem() {
        MemFlags::IOMEM
    } else {
        MemFlags::STRUCT_PAGE
    }
}

pub(crate) fn domains_for(resource: &Resource) -> Domains {
    if resource.cpu_maps_iomem() || !resource.is_cached() {
        Domains::WC
    } else {
        Domains::CPU
    }
}
