//! GPU address spaces.
//!
//! An [`AddressSpace`] owns a range manager over its virtual range, the list
//! of VMAs bound into it (least recently bound first) and the asynchronous
//! unbinds still in flight. All of it is guarded by one mutex, taken through
//! [`AddressSpace::lock`]. Page tables sit behind a separate, inner lock so
//! that bind and unbind workers can program them without the address-space
//! lock.

pub mod evict;
pub mod page_table;
pub mod range;

use crate::config::VmDesc;
use crate::context::Gt;
use crate::error::{VmaError, VmaResult};
use crate::fence::Fence;
use crate::utils::GTT_PAGE_SIZE;
use crate::vma::{Vma, VmaFlags};
use evict::{Evictor, IdleEvictor};
use page_table::PageTable;
use parking_lot::{Mutex, MutexGuard, RwLock};
use range::{Node, RangeManager};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

/// Identity of an address space; orders VMAs in the per-object registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    /// The global address space always sorts first.
    pub const GGTT: Self = Self(0);

    #[must_use]
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// An unbind whose page-table clear has not completed yet.
#[derive(Debug, Clone)]
pub struct PendingUnbind {
    pub start: u64,
    pub end: u64,
    pub fence: Fence,
}

/// State guarded by the address-space mutex.
#[derive(Debug)]
pub struct VmState {
    mm: RangeManager,
    bound: Vec<Weak<Vma>>,
    pending_unbinds: Vec<PendingUnbind>,
}

impl VmState {
    /// # Errors
    /// See [`RangeManager::reserve_fixed`].
    pub fn reserve_fixed(&mut self, size: u64, offset: u64, color: u64) -> VmaResult<Node> {
        self.mm.reserve_fixed(size, offset, color)
    }

    /// # Errors
    /// See [`RangeManager::insert_best_fit`].
    pub fn insert_best_fit(
        &mut self,
        size: u64,
        alignment: u64,
        color: u64,
        start: u64,
        end: u64,
    ) -> VmaResult<Node> {
        self.mm.insert_best_fit(size, alignment, color, start, end)
    }

    pub fn remove(&mut self, start: u64) -> Option<Node> {
        self.mm.remove(start)
    }

    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.mm.iter().copied().collect()
    }

    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.mm.allocated_bytes()
    }

    pub fn add_pending_unbind(&mut self, start: u64, end: u64, fence: Fence) {
        self.pending_unbinds.retain(|p| !p.fence.is_signaled());
        self.pending_unbinds.push(PendingUnbind { start, end, fence });
    }

    /// Fences of in-flight unbinds overlapping `[start, end)`.
    pub fn pending_unbinds(&mut self, start: u64, end: u64) -> Vec<Fence> {
        self.pending_unbinds.retain(|p| !p.fence.is_signaled());
        self.pending_unbinds
            .iter()
            .filter(|p| p.start < end && start < p.end)
            .map(|p| p.fence.clone())
            .collect()
    }

    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.bound.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Moves `vma` to the most recently bound end of the list.
    pub(crate) fn track_bound(&mut self, vma: &Vma) {
        self.untrack_bound(vma);
        self.bound.push(vma.weak());
    }

    pub(crate) fn untrack_bound(&mut self, vma: &Vma) {
        self.bound
            .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), vma));
    }
}

/// Exclusive access to a [`VmState`].
///
/// VMAs picked up while the lock is held must not be dropped under it, since
/// dropping the last reference unbinds and so retakes the lock. Such
/// references go to [`defer_drop`](Self::defer_drop) and are released after
/// the mutex.
pub struct VmGuard<'a> {
    // Declared first so the mutex is released before the graveyard drops.
    state: MutexGuard<'a, VmState>,
    graveyard: Vec<Arc<Vma>>,
}

impl<'a> VmGuard<'a> {
    fn new(state: MutexGuard<'a, VmState>) -> Self {
        Self {
            state,
            graveyard: Vec::new(),
        }
    }

    pub fn defer_drop(&mut self, vma: Arc<Vma>) {
        self.graveyard.push(vma);
    }

    pub fn defer_drop_all(&mut self, vmas: Vec<Arc<Vma>>) {
        self.graveyard.extend(vmas);
    }

    /// Live bound VMAs, least recently bound first. Hand them back through
    /// [`defer_drop_all`](Self::defer_drop_all).
    #[must_use]
    pub fn bound_snapshot(&self) -> Vec<Arc<Vma>> {
        self.state.bound.iter().filter_map(Weak::upgrade).collect()
    }
}

impl Deref for VmGuard<'_> {
    type Target = VmState;

    fn deref(&self) -> &VmState {
        &self.state
    }
}

impl DerefMut for VmGuard<'_> {
    fn deref_mut(&mut self) -> &mut VmState {
        &mut self.state
    }
}

/// Placement request for [`AddressSpace::insert_node`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeRequest {
    pub size: u64,
    pub alignment: u64,
    pub color: u64,
    pub start: u64,
    pub end: u64,
    pub fixed: Option<u64>,
    pub evict: bool,
}

pub struct AddressSpace {
    id: AddressSpaceId,
    is_ggtt: bool,
    total: u64,
    mappable_end: u64,
    coloring: bool,
    bind_async: VmaFlags,
    gt: Arc<Gt>,
    state: Mutex<VmState>,
    pt: Mutex<PageTable>,
    evictor: RwLock<Arc<dyn Evictor>>,
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("is_ggtt", &self.is_ggtt)
            .field("total", &self.total)
            .field("coloring", &self.coloring)
            .finish_non_exhaustive()
    }
}

impl AddressSpace {
    #[must_use]
    pub(crate) fn new(gt: Arc<Gt>, id: AddressSpaceId, desc: &VmDesc, is_ggtt: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            is_ggtt,
            total: desc.total,
            mappable_end: desc.mappable_end.min(desc.total),
            coloring: desc.coloring,
            bind_async: desc.bind_async,
            gt,
            state: Mutex::new(VmState {
                mm: RangeManager::new(0, desc.total).with_color_adjust(desc.coloring),
                bound: Vec::new(),
                pending_unbinds: Vec::new(),
            }),
            pt: Mutex::new(PageTable::new()),
            evictor: RwLock::new(Arc::new(IdleEvictor)),
        })
    }

    #[must_use]
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    #[must_use]
    pub fn is_ggtt(&self) -> bool {
        self.is_ggtt
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn mappable_end(&self) -> u64 {
        self.mappable_end
    }

    #[must_use]
    pub fn has_cache_coloring(&self) -> bool {
        self.coloring
    }

    /// Bind kinds whose page-table writes are deferred to a worker.
    #[must_use]
    pub fn bind_async_flags(&self) -> VmaFlags {
        self.bind_async
    }

    #[must_use]
    pub fn gt(&self) -> &Arc<Gt> {
        &self.gt
    }

    pub fn lock(&self) -> VmGuard<'_> {
        VmGuard::new(self.state.lock())
    }

    pub fn try_lock(&self) -> Option<VmGuard<'_>> {
        self.state.try_lock().map(VmGuard::new)
    }

    pub(crate) fn pt(&self) -> MutexGuard<'_, PageTable> {
        self.pt.lock()
    }

    #[must_use]
    pub fn evictor(&self) -> Arc<dyn Evictor> {
        self.evictor.read().clone()
    }

    pub fn set_evictor(&self, evictor: Arc<dyn Evictor>) {
        *self.evictor.write() = evictor;
    }

    /// Evicts every idle, unpinned VMA. Returns how many were unbound.
    ///
    /// # Errors
    /// Propagates unbind failures.
    pub fn evict_all(&self) -> VmaResult<usize> {
        let mut guard = self.lock();
        self.evictor().evict_all(self, &mut guard, false)
    }

    /// Snapshot of the allocated nodes in address order.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.state.lock().nodes()
    }

    #[must_use]
    pub fn pte(&self, addr: u64) -> u64 {
        self.pt.lock().pte(addr)
    }

    #[must_use]
    pub fn translate(&self, addr: u64) -> Option<u64> {
        self.pt.lock().translate(addr)
    }

    /// Allocates a node, evicting if the request allows it.
    pub(crate) fn insert_node(&self, guard: &mut VmGuard<'_>, req: NodeRequest) -> VmaResult<Node> {
        if let Some(offset) = req.fixed {
            let first = guard.reserve_fixed(req.size, offset, req.color);
            let err = match first {
                Err(e @ (VmaError::NoSpace | VmaError::Conflict { .. })) if req.evict => e,
                other => return other,
            };

            // Neighbours of another colour keep a guard page from us.
            let band = if self.coloring { GTT_PAGE_SIZE } else { 0 };
            let evicted = self.evictor().evict_range(
                self,
                guard,
                offset.saturating_sub(band),
                offset.saturating_add(req.size).saturating_add(band),
                true,
            )?;
            if evicted == 0 {
                return Err(err);
            }
            return guard.reserve_fixed(req.size, offset, req.color);
        }

        match Self::best_fit(guard, &req) {
            Err(VmaError::NoSpace) if req.evict => {}
            other => return other,
        }

        let evictor = self.evictor();
        if evictor.evict_range(self, guard, req.start, req.end, true)? > 0 {
            match Self::best_fit(guard, &req) {
                Err(VmaError::NoSpace) => {}
                other => return other,
            }
        }
        if evictor.evict_all(self, guard, true)? > 0 {
            return Self::best_fit(guard, &req);
        }
        Err(VmaError::NoSpace)
    }

    fn best_fit(guard: &mut VmGuard<'_>, req: &NodeRequest) -> VmaResult<Node> {
        guard.insert_best_fit(req.size, req.alignment, req.color, req.start, req.end)
    }
}
