//! Virtual memory areas.
//!
//! A [`Vma`] maps one object's pages, under one [`View`], into one
//! [`AddressSpace`]. Its flag word packs the pin count (low ten bits) with
//! the bind state, so that the common "already bound, just pin it" case is a
//! single compare-and-swap.
//!
//! Lock order: object lock, then address-space lock, then the VMA's own
//! state lock.

pub mod active;
pub mod bind;
pub mod closed;
pub mod iomap;
pub mod registry;
pub mod view;

use crate::context::Gt;
use crate::error::{VmaError, VmaResult};
use crate::fence::OperationCtx;
use crate::gtt::AddressSpace;
use crate::gtt::range::Node;
use crate::mem::{CacheLevel, SgTable};
use crate::object::BufferObject;
use crate::utils::{GTT_PAGE_SIZE, align_up};
use active::ActiveTracker;
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

pub use iomap::IoMap;
pub use registry::{VmaKey, instance};
pub use view::{PlaneInfo, View};

/// Bits of the flag word holding the pin count.
pub const PIN_MASK: u32 = 0x3ff;

/// Highest pin count a VMA can reach; one more pin fails with `Overflow`.
pub const MAX_PIN_COUNT: u32 = PIN_MASK;

/// Fence registers cover the GGTT in units of this size.
pub const FENCE_GRANULE: u64 = 64 << 10;

const ZONE_4G_END: u64 = 1 << 32;
const NO_FENCE: usize = usize::MAX;

bitflags! {
    /// Bind state kept above the pin count in the flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VmaFlags: u32 {
        const GLOBAL_BIND = 1 << 10;
        const LOCAL_BIND  = 1 << 11;
        const ERROR       = 1 << 12;
        const GGTT        = 1 << 13;
        const CAN_FENCE   = 1 << 14;
        const USERFAULT   = 1 << 15;
        const GGTT_WRITE  = 1 << 16;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PinFlags: u32 {
        /// Fail with `Busy` instead of waiting for the address-space lock.
        const NONBLOCK     = 1 << 0;
        /// Do not evict to make room.
        const NOEVICT      = 1 << 1;
        /// Place inside the CPU-mappable aperture.
        const MAPPABLE     = 1 << 3;
        /// Place below 4 GiB.
        const ZONE_4G      = 1 << 4;
        /// Place at or above the request offset.
        const OFFSET_BIAS  = 1 << 6;
        /// Place exactly at the request offset.
        const OFFSET_FIXED = 1 << 7;
        /// Bind if needed but do not take a pin.
        const VALIDATE     = 1 << 8;
        const GLOBAL       = 1 << 10;
        const USER         = 1 << 11;
    }
}

impl VmaFlags {
    pub const BIND_MASK: Self = Self::GLOBAL_BIND.union(Self::LOCAL_BIND);
}

impl PinFlags {
    /// The bind kinds requested; `GLOBAL`/`USER` share their bits with
    /// `GLOBAL_BIND`/`LOCAL_BIND`.
    #[must_use]
    pub const fn bind_flags(self) -> VmaFlags {
        VmaFlags::from_bits_truncate(self.bits() & VmaFlags::BIND_MASK.bits())
    }
}

/// Placement and bind request for [`Vma::pin`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PinRequest {
    pub size: u64,
    pub alignment: u64,
    /// Bias or fixed offset, depending on the flags.
    pub offset: u64,
    pub flags: PinFlags,
}

impl PinRequest {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            size: 0,
            alignment: 0,
            offset: 0,
            flags: PinFlags::empty(),
        }
    }

    #[must_use]
    pub const fn global(mut self) -> Self {
        self.flags = self.flags.union(PinFlags::GLOBAL);
        self
    }

    #[must_use]
    pub const fn user(mut self) -> Self {
        self.flags = self.flags.union(PinFlags::USER);
        self
    }

    #[must_use]
    pub const fn mappable(mut self) -> Self {
        self.flags = self.flags.union(PinFlags::MAPPABLE);
        self
    }

    #[must_use]
    pub const fn zone_4g(mut self) -> Self {
        self.flags = self.flags.union(PinFlags::ZONE_4G);
        self
    }

    #[must_use]
    pub const fn bias(mut self, offset: u64) -> Self {
        self.flags = self.flags.union(PinFlags::OFFSET_BIAS);
        self.offset = offset;
        self
    }

    #[must_use]
    pub const fn fixed(mut self, offset: u64) -> Self {
        self.flags = self.flags.union(PinFlags::OFFSET_FIXED);
        self.offset = offset;
        self
    }

    #[must_use]
    pub const fn nonblock(mut self) -> Self {
        self.flags = self.flags.union(PinFlags::NONBLOCK);
        self
    }

    #[must_use]
    pub const fn noevict(mut self) -> Self {
        self.flags = self.flags.union(PinFlags::NOEVICT);
        self
    }

    #[must_use]
    pub const fn validate(mut self) -> Self {
        self.flags = self.flags.union(PinFlags::VALIDATE);
        self
    }

    #[must_use]
    pub const fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub const fn alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }
}

#[derive(Debug, Default)]
pub(crate) struct VmaState {
    pub(crate) node: Option<Node>,
    pub(crate) pages: Option<Arc<SgTable>>,
    pub(crate) pages_count: u32,
    pub(crate) cache_level: CacheLevel,
}

pub struct Vma {
    me: Weak<Vma>,
    obj: Arc<BufferObject>,
    vm: Arc<AddressSpace>,
    view: View,
    size: u64,
    fence_size: u64,
    fence_alignment: u64,
    flags: AtomicU32,
    state: Mutex<VmaState>,
    active: ActiveTracker,
    open_count: AtomicU32,
    closed: AtomicBool,
    fence: AtomicUsize,
}

impl std::fmt::Debug for Vma {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vma")
            .field("obj", &self.obj.id())
            .field("vm", &self.vm.id())
            .field("view", &self.view)
            .field("size", &self.size)
            .field("flags", &self.flags())
            .field("pin_count", &self.pin_count())
            .finish_non_exhaustive()
    }
}

impl Vma {
    /// Builds a VMA, checking the view against the object and the address
    /// space.
    pub(crate) fn create(
        obj: &Arc<BufferObject>,
        vm: &Arc<AddressSpace>,
        view: View,
    ) -> VmaResult<Arc<Self>> {
        if !view.is_normal() && !vm.is_ggtt() {
            return Err(VmaError::InvalidArgument(
                "only the global address space supports views".into(),
            ));
        }
        view.validate(obj.num_pages())?;

        let size = view
            .size_pages(obj.num_pages())
            .and_then(|pages| pages.checked_mul(GTT_PAGE_SIZE))
            .ok_or(VmaError::NoSpace)?;
        if size > vm.total() {
            return Err(VmaError::NoSpace);
        }

        let (fence_size, fence_alignment, flags) = if vm.is_ggtt() {
            (
                align_up(size, FENCE_GRANULE),
                FENCE_GRANULE,
                VmaFlags::GGTT,
            )
        } else {
            (size, GTT_PAGE_SIZE, VmaFlags::empty())
        };

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            obj: obj.clone(),
            vm: vm.clone(),
            view,
            size,
            fence_size,
            fence_alignment,
            flags: AtomicU32::new(flags.bits()),
            state: Mutex::new(VmaState::default()),
            active: ActiveTracker::default(),
            open_count: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            fence: AtomicUsize::new(NO_FENCE),
        }))
    }

    #[must_use]
    pub fn obj(&self) -> &Arc<BufferObject> {
        &self.obj
    }

    #[must_use]
    pub fn vm(&self) -> &Arc<AddressSpace> {
        &self.vm
    }

    #[must_use]
    pub fn gt(&self) -> &Arc<Gt> {
        self.vm.gt()
    }

    #[must_use]
    pub fn view(&self) -> &View {
        &self.view
    }

    #[must_use]
    pub fn key(&self) -> VmaKey {
        VmaKey::new(self.vm.id(), self.view)
    }

    /// Size of the mapping in bytes, padding included.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn fence_size(&self) -> u64 {
        self.fence_size
    }

    #[must_use]
    pub fn node(&self) -> Option<Node> {
        self.state.lock().node
    }

    #[must_use]
    pub fn offset(&self) -> Option<u64> {
        self.node().map(|n| n.start)
    }

    /// Bind state, without the pin count.
    #[must_use]
    pub fn flags(&self) -> VmaFlags {
        VmaFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn pin_count(&self) -> u32 {
        self.flags.load(Ordering::Acquire) & PIN_MASK
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    #[must_use]
    pub fn is_bound(&self, kinds: VmaFlags) -> bool {
        self.flags().intersects(kinds & VmaFlags::BIND_MASK)
    }

    #[must_use]
    pub fn is_ggtt(&self) -> bool {
        self.flags().contains(VmaFlags::GGTT)
    }

    #[must_use]
    pub fn is_map_and_fenceable(&self) -> bool {
        self.flags().contains(VmaFlags::CAN_FENCE)
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.flags().contains(VmaFlags::ERROR)
    }

    #[must_use]
    pub fn active(&self) -> &ActiveTracker {
        &self.active
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.active.is_idle()
    }

    /// Page list of the view, while the VMA holds its pages.
    #[must_use]
    pub fn pages(&self) -> Option<Arc<SgTable>> {
        self.state.lock().pages.clone()
    }

    #[must_use]
    pub fn fence_id(&self) -> Option<usize> {
        match self.fence.load(Ordering::Acquire) {
            NO_FENCE => None,
            id => Some(id),
        }
    }

    /// Drops one pin.
    pub fn unpin(&self) {
        let prev = self.flags.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & PIN_MASK > 0, "unpin of an unpinned vma");
    }

    pub(crate) fn weak(&self) -> Weak<Self> {
        self.me.clone()
    }

    pub(crate) fn set_fence(&self, id: usize) {
        self.fence.store(id, Ordering::Release);
    }

    /// Forgets register `id`, unless another one was assigned since.
    pub(crate) fn clear_fence(&self, id: usize) {
        let _ = self
            .fence
            .compare_exchange(id, NO_FENCE, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, VmaState> {
        self.state.lock()
    }

    pub(crate) fn set_flags(&self, flags: VmaFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: VmaFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Clears `flags` unless the VMA is pinned.
    pub(crate) fn clear_flags_unpinned(&self, flags: VmaFlags) -> VmaResult<()> {
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur & PIN_MASK == 0).then_some(cur & !flags.bits())
            })
            .map(|_| ())
            .map_err(|_| VmaError::Busy)
    }

    /// Pins if the requested bind kinds are already in place.
    pub(crate) fn try_qad_pin(&self, bind: VmaFlags) -> bool {
        let mut cur = self.flags.load(Ordering::Acquire);
        loop {
            let flags = VmaFlags::from_bits_truncate(cur);
            if flags.contains(VmaFlags::ERROR)
                || !flags.contains(bind)
                || cur & PIN_MASK == MAX_PIN_COUNT
            {
                return false;
            }
            match self.flags.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Takes a pin without any checks beyond overflow.
    pub(crate) fn pin_raw(&self) -> VmaResult<()> {
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur & PIN_MASK < MAX_PIN_COUNT).then_some(cur + 1)
            })
            .map(|_| ())
            .map_err(|_| VmaError::Overflow)
    }

    /// Takes a reference on the view's pages, acquiring the object's pages
    /// on first use.
    pub(crate) fn get_pages(&self) -> VmaResult<Arc<SgTable>> {
        {
            let mut st = self.state.lock();
            if let Some(pages) = st.pages.clone() {
                st.pages_count += 1;
                return Ok(pages);
            }
        }

        let obj_pages = self.obj.pin_pages()?;
        let pages = self.view.build_pages(&obj_pages);

        let mut st = self.state.lock();
        if let Some(existing) = st.pages.clone() {
            // Raced with another pin; keep theirs.
            st.pages_count += 1;
            drop(st);
            self.obj.unpin_pages();
            return Ok(existing);
        }
        st.pages = Some(pages.clone());
        st.pages_count = 1;
        Ok(pages)
    }

    pub(crate) fn put_pages(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.pages_count > 0, "vma pages released too often");
        st.pages_count = st.pages_count.saturating_sub(1);
        if st.pages_count == 0 && st.pages.take().is_some() {
            drop(st);
            self.obj.unpin_pages();
        }
    }

    /// Whether the current node fits `req`; a misplaced VMA must be unbound
    /// before it can be pinned for `req`.
    #[must_use]
    pub fn misplaced(&self, req: &PinRequest) -> bool {
        let Some(node) = self.node() else {
            return false;
        };
        let flags = req.flags;

        self.has_error()
            || node.size < req.size
            || (req.alignment > 0 && node.start % req.alignment != 0)
            || (flags.contains(PinFlags::MAPPABLE) && !self.is_map_and_fenceable())
            || (flags.contains(PinFlags::OFFSET_BIAS) && node.start < req.offset)
            || (flags.contains(PinFlags::OFFSET_FIXED) && node.start != req.offset)
            || (flags.contains(PinFlags::ZONE_4G) && node.end() > ZONE_4G_END)
    }
}

impl Drop for Vma {
    fn drop(&mut self) {
        if self.state.get_mut().node.is_some() {
            let mut guard = self.vm.lock();
            if self.pin_count() > 0 {
                log::warn!("vma of object {} dropped while pinned", self.obj.id());
                self.flags.fetch_and(!PIN_MASK, Ordering::AcqRel);
            }
            if let Err(err) = self.unbind_locked(&mut guard, &OperationCtx::new()) {
                log::warn!("vma of object {}: unbind on release failed: {err}", self.obj.id());
            }
        }
        self.gt().fence_regs().release(self);
        self.obj.vmas.write().remove(self);
    }
}
