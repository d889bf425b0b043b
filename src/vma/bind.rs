//! Pinning, binding and unbinding of VMAs.

use super::{MAX_PIN_COUNT, PinFlags, PinRequest, Vma, VmaFlags, ZONE_4G_END};
use crate::error::{VmaError, VmaResult};
use crate::fence::{DepKind, Fence, FenceWork, OperationCtx, might_sleep};
use crate::gtt::page_table::{PtStash, PteFlags};
use crate::gtt::range::Node;
use crate::gtt::{AddressSpace, NodeRequest, VmGuard};
use crate::mem::{CacheLevel, SgTable};
use crate::utils::{GTT_MIN_ALIGNMENT, is_aligned, range_overflows};
use crate::worker::WorkerPool;
use std::sync::{Arc, Weak};

/// Flags dropped together with the binding.
const BINDING_STATE: VmaFlags = VmaFlags::BIND_MASK
    .union(VmaFlags::ERROR)
    .union(VmaFlags::CAN_FENCE)
    .union(VmaFlags::USERFAULT)
    .union(VmaFlags::GGTT_WRITE);

/// Object state sampled before the address-space lock is taken.
#[derive(Debug, Clone, Copy)]
struct BindParams {
    cache_level: CacheLevel,
    lmem: bool,
}

struct BindJob {
    vma: Weak<Vma>,
    vm: Arc<AddressSpace>,
    start: u64,
    size: u64,
    pages: Arc<SgTable>,
    pte: PteFlags,
}

/// A bind deferred to the worker pool, with its page-table pages allocated
/// up front.
struct BindWork {
    work: FenceWork,
    stash: PtStash,
    job: Option<BindJob>,
}

impl BindWork {
    fn new(vm: &AddressSpace, size: u64) -> Self {
        Self {
            work: FenceWork::new("bind"),
            stash: if vm.is_ggtt() {
                PtStash::default()
            } else {
                PtStash::for_size(size)
            },
            job: None,
        }
    }

    fn commit(self, workers: &Arc<WorkerPool>) {
        let Self {
            work,
            mut stash,
            job,
        } = self;
        let Some(job) = job else {
            return;
        };

        let pool = workers.clone();
        work.commit(workers, move |deps| {
            if let Err(err) = deps {
                log::warn!("bind at 0x{:x} failed: {err}", job.start);
                if let Some(vma) = job.vma.upgrade() {
                    vma.set_flags(VmaFlags::ERROR);
                    // The last reference would unbind, and so wait on this
                    // very bind; release it from another job.
                    pool.queue_work(Box::new(move || drop(vma)));
                }
                return Err(err);
            }

            let mut pt = job.vm.pt();
            pt.allocate_va_range(Some(&mut stash), job.start, job.size);
            pt.insert_entries(job.start, job.pages.page_addrs(), job.pte);
            Ok(())
        });
    }
}

fn chain_retired(work: &mut FenceWork, fence: &Fence, kind: DepKind) {
    if let Err(err) = work.chain(Some(fence), kind) {
        log::trace!("{}: dependency already failed: {err}", work.fence().name());
    }
}

impl Vma {
    /// Pins the VMA, allocating address space and binding it first if the
    /// requested bind kinds are not in place yet.
    ///
    /// # Errors
    /// - `InvalidArgument` without a bind kind, or for a bad fixed offset.
    /// - `Closed` once the VMA was closed.
    /// - `Busy` if `NONBLOCK` and the address space is locked.
    /// - `ErrorState` after a failed asynchronous bind.
    /// - `Overflow` at [`MAX_PIN_COUNT`].
    /// - `NoSpace` if no placement fits.
    pub fn pin(&self, req: &PinRequest, ctx: &OperationCtx) -> VmaResult<()> {
        let bind = req.flags.bind_flags();
        if bind.is_empty() {
            return Err(VmaError::InvalidArgument("pin without a bind kind".into()));
        }
        if bind.contains(VmaFlags::GLOBAL_BIND) && !self.vm.is_ggtt() {
            return Err(VmaError::InvalidArgument(
                "global bind outside the global address space".into(),
            ));
        }
        if self.is_closed() {
            return Err(VmaError::Closed);
        }
        if !req.flags.contains(PinFlags::VALIDATE) && self.try_qad_pin(bind) {
            return Ok(());
        }

        might_sleep();
        self.get_pages()?;
        let result = self.pin_slow(req, bind, ctx);
        self.put_pages();
        result
    }

    fn pin_slow(&self, req: &PinRequest, bind: VmaFlags, ctx: &OperationCtx) -> VmaResult<()> {
        let (params, moving) = {
            let st = self.obj.lock();
            let params = BindParams {
                cache_level: st.cache_level,
                lmem: st.resource.gtt_binds_lmem(),
            };
            (params, st.moving().cloned())
        };
        let _wakeref = bind
            .contains(VmaFlags::GLOBAL_BIND)
            .then(|| self.gt().runtime_pm().get());

        let mut work = if self.vm.bind_async_flags().intersects(bind) || moving.is_some() {
            let mut work = BindWork::new(&self.vm, self.size);
            work.work.chain(moving.as_ref(), DepKind::Moving)?;
            Some(work)
        } else {
            None
        };

        let mut guard = if req.flags.contains(PinFlags::NONBLOCK) {
            self.vm.try_lock().ok_or(VmaError::Busy)?
        } else {
            self.vm.lock()
        };

        if self.is_closed() {
            return Err(VmaError::Closed);
        }
        if self.has_error() {
            return Err(VmaError::ErrorState);
        }
        if self.pin_count() >= MAX_PIN_COUNT {
            return Err(VmaError::Overflow);
        }

        let inserted = if self.node().is_none() {
            self.insert(&mut guard, req, params)?;
            true
        } else {
            false
        };

        let used = match self.bind(&mut guard, bind, params, work.as_mut(), ctx) {
            Ok(used) => used,
            Err(err) => {
                if inserted {
                    self.remove_node(&mut guard);
                }
                return Err(err);
            }
        };

        if inserted {
            // The binding keeps its own reference on the pages.
            self.state().pages_count += 1;
        }
        let pinned = if req.flags.contains(PinFlags::VALIDATE) {
            Ok(())
        } else {
            self.pin_raw()
        };
        drop(guard);

        if let Some(work) = work.filter(|_| used) {
            work.commit(self.gt().workers());
        }
        pinned
    }

    fn insert(&self, guard: &mut VmGuard<'_>, req: &PinRequest, params: BindParams) -> VmaResult<()> {
        let flags = req.flags;
        let mut size = req.size.max(self.size);
        let mut alignment = req.alignment.max(GTT_MIN_ALIGNMENT);
        if flags.contains(PinFlags::MAPPABLE) {
            size = size.max(self.fence_size);
            alignment = alignment.max(self.fence_alignment);
        }

        let start = if flags.contains(PinFlags::OFFSET_BIAS) {
            req.offset
        } else {
            0
        };
        let mut end = self.vm.total();
        if flags.contains(PinFlags::MAPPABLE) {
            end = end.min(self.vm.mappable_end());
        }
        if flags.contains(PinFlags::ZONE_4G) {
            end = end.min(ZONE_4G_END);
        }

        if size > end.saturating_sub(start) {
            log::debug!(
                "vma of object {}: 0x{size:x} bytes do not fit in [0x{start:x}, 0x{end:x})",
                self.obj.id()
            );
            return Err(VmaError::NoSpace);
        }

        let fixed = if flags.contains(PinFlags::OFFSET_FIXED) {
            let offset = req.offset;
            if !is_aligned(offset, alignment) || range_overflows(offset, size, end) {
                return Err(VmaError::InvalidArgument(format!(
                    "fixed offset 0x{offset:x} unaligned or out of range"
                )));
            }
            Some(offset)
        } else {
            None
        };

        let color = if self.vm.has_cache_coloring() {
            params.cache_level.color()
        } else {
            0
        };

        let node = self.vm.insert_node(
            guard,
            NodeRequest {
                size,
                alignment,
                color,
                start,
                end,
                fixed,
                evict: !flags.contains(PinFlags::NOEVICT),
            },
        )?;

        self.state().node = Some(node);
        guard.track_bound(self);
        if self.is_ggtt() {
            self.update_fenceable(&node);
        }
        Ok(())
    }

    fn update_fenceable(&self, node: &Node) {
        let fenceable =
            node.size >= self.fence_size && is_aligned(node.start, self.fence_alignment);
        let mappable = node.end() <= self.vm.mappable_end();
        if fenceable && mappable {
            self.set_flags(VmaFlags::CAN_FENCE);
        } else {
            self.clear_flags(VmaFlags::CAN_FENCE);
        }
    }

    /// Writes the page-table entries for the bind kinds not yet in place.
    /// Returns whether `work` took the job.
    fn bind(
        &self,
        guard: &mut VmGuard<'_>,
        bind: VmaFlags,
        params: BindParams,
        work: Option<&mut BindWork>,
        ctx: &OperationCtx,
    ) -> VmaResult<bool> {
        let bind = bind.difference(self.flags() & VmaFlags::BIND_MASK);
        if bind.is_empty() {
            return Ok(false);
        }

        let (node, pages) = {
            let st = self.state();
            (st.node, st.pages.clone())
        };
        let (Some(node), Some(pages)) = (node, pages) else {
            return Err(VmaError::InvalidArgument("bind without node or pages".into()));
        };
        let pte = PteFlags::encode(params.cache_level, params.lmem);
        let pending = guard.pending_unbinds(node.start, node.end());

        let used = if let Some(work) = work {
            for fence in &pending {
                work.work.chain(Some(fence), DepKind::Unbind)?;
            }
            work.work
                .chain(self.active.exclusive().as_ref(), DepKind::Chain)?;
            work.job = Some(BindJob {
                vma: self.weak(),
                vm: self.vm.clone(),
                start: node.start,
                size: node.size,
                pages,
                pte,
            });
            self.active.set_exclusive(work.work.fence().clone());
            true
        } else {
            for fence in &pending {
                fence.wait_ctx(ctx)?;
            }
            let mut pt = self.vm.pt();
            pt.allocate_va_range(None, node.start, node.size);
            pt.insert_entries(node.start, pages.page_addrs(), pte);
            false
        };

        self.set_flags(bind);
        self.state().cache_level = params.cache_level;
        Ok(used)
    }

    /// Returns the node to the address space. The caller owns the pages
    /// reference of the binding.
    fn remove_node(&self, guard: &mut VmGuard<'_>) -> Option<Node> {
        let node = self.state().node.take()?;
        guard.remove(node.start);
        guard.untrack_bound(self);
        self.clear_flags(VmaFlags::CAN_FENCE);
        Some(node)
    }

    /// Pins into the global address space, moving the VMA if its current
    /// placement does not satisfy `req` and evicting if nothing fits.
    ///
    /// # Errors
    /// `NoSpace` if a misplaced VMA is still in use or nothing can be
    /// evicted; otherwise as [`pin`](Self::pin).
    pub fn ggtt_pin(&self, req: &PinRequest, ctx: &OperationCtx) -> VmaResult<()> {
        if !self.vm.is_ggtt() {
            return Err(VmaError::InvalidArgument(
                "ggtt pin outside the global address space".into(),
            ));
        }
        let req = req.global();

        if self.misplaced(&req) {
            if self.is_pinned() || self.is_active() {
                return Err(VmaError::NoSpace);
            }
            self.unbind(ctx)?;
        }

        loop {
            match self.pin(&req, ctx) {
                Err(VmaError::NoSpace) => {}
                other => return other,
            }
            if self.vm.evict_all()? == 0 {
                return Err(VmaError::NoSpace);
            }
        }
    }

    /// Unbinds synchronously, waiting for all users first.
    ///
    /// # Errors
    /// `Busy` while pinned, or an interrupted wait.
    pub fn unbind(&self, ctx: &OperationCtx) -> VmaResult<()> {
        might_sleep();
        if self.node().is_none() {
            return Ok(());
        }
        if self.is_pinned() {
            return Err(VmaError::Busy);
        }

        let _wakeref = self
            .is_bound(VmaFlags::GLOBAL_BIND)
            .then(|| self.gt().runtime_pm().get());
        let mut guard = self.vm.lock();
        self.unbind_locked(&mut guard, ctx)
    }

    pub(crate) fn unbind_locked(&self, guard: &mut VmGuard<'_>, ctx: &OperationCtx) -> VmaResult<()> {
        if self.node().is_none() {
            return Ok(());
        }
        if self.is_pinned() {
            return Err(VmaError::Busy);
        }
        self.active.sync(ctx)?;

        let was = self.flags();
        self.clear_flags_unpinned(BINDING_STATE)?;
        self.gt().fence_regs().release(self);

        if let Some(node) = self.remove_node(guard) {
            if was.intersects(VmaFlags::BIND_MASK) {
                self.vm.pt().clear_range(node.start, node.size);
            }
            self.put_pages();
        }
        Ok(())
    }

    /// Unbinds without waiting. The address range is released at once; the
    /// page-table clear runs after the VMA's users and the object's
    /// reservation fences, and later binds over the range wait for it.
    ///
    /// Returns the fence of the clear, or `None` if nothing was bound.
    ///
    /// # Errors
    /// `Busy` while pinned, or if `trylock` and the address space is locked.
    pub fn unbind_async(&self, trylock: bool) -> VmaResult<Option<Fence>> {
        if self.node().is_none() {
            return Ok(None);
        }
        if self.is_pinned() {
            return Err(VmaError::Busy);
        }

        let _wakeref = self
            .is_bound(VmaFlags::GLOBAL_BIND)
            .then(|| self.gt().runtime_pm().get());
        let mut guard = if trylock {
            self.vm.try_lock().ok_or(VmaError::Busy)?
        } else {
            self.vm.lock()
        };
        if self.node().is_none() {
            return Ok(None);
        }

        let was = self.flags();
        self.clear_flags_unpinned(BINDING_STATE)?;
        self.gt().fence_regs().release(self);

        let mut work = FenceWork::new("unbind");
        for fence in self.active.fences() {
            chain_retired(&mut work, &fence, DepKind::Chain);
        }
        let (exclusive, shared) = self.obj.resv().fences();
        if let Some(fence) = &exclusive {
            chain_retired(&mut work, fence, DepKind::Exclusive);
        }
        for fence in &shared {
            chain_retired(&mut work, fence, DepKind::Shared);
        }

        let Some(node) = self.remove_node(&mut guard) else {
            return Ok(None);
        };
        let fence = work.fence().clone();
        guard.add_pending_unbind(node.start, node.end(), fence.clone());
        self.obj.resv().add_shared(&fence);
        self.put_pages();
        drop(guard);

        let vm = self.vm.clone();
        let clear = was.intersects(VmaFlags::BIND_MASK);
        work.commit(self.gt().workers(), move |_| {
            if clear {
                vm.pt().clear_range(node.start, node.size);
            }
            Ok(())
        });
        Ok(Some(fence))
    }

    /// Pins a fence register for the VMA.
    ///
    /// # Errors
    /// `InvalidArgument` unless pinned, globally bound and fenceable; `Busy`
    /// if every register is pinned.
    pub fn pin_fence(&self) -> VmaResult<usize> {
        if !self.is_pinned() || !self.is_bound(VmaFlags::GLOBAL_BIND) {
            return Err(VmaError::InvalidArgument(
                "fence for an unpinned or unbound vma".into(),
            ));
        }
        if !self.is_map_and_fenceable() {
            return Err(VmaError::InvalidArgument("vma is not fenceable".into()));
        }
        let _wakeref = self.gt().runtime_pm().get();
        self.gt().fence_regs().pin(self)
    }

    pub fn unpin_fence(&self) {
        if let Some(id) = self.fence_id() {
            self.gt().fence_regs().unpin(id);
        }
    }
}
