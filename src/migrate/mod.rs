//! Buffer migration between memory regions.
//!
//! A move first tries the copy engine. When the destination is local memory,
//! or a failure switch is set, a CPU copy is armed behind the engine fence
//! so that an engine error never leaves the destination with stale contents.
//! Without an engine, or when arming fails, the copy runs on the CPU before
//! `move_object` returns.

pub mod engine;
mod memcpy;
pub mod selftest;

use crate::context::Gt;
use crate::error::{VmaError, VmaResult};
use crate::fence::{DepKind, DependencySet, Fence, OperationCtx, might_sleep};
use crate::mem::{MemoryRegion, Resource};
use crate::object::{
    BufferObject, Madvise, ObjectFlags, ObjectState, UnbindFlags, domains_for, mem_flags_for,
};
use memcpy::{Armed, MemcpyArg};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use engine::{Blitter, CopyEngine};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    accel_submits: AtomicU64,
    irq_completions: AtomicU64,
    worker_fallbacks: AtomicU64,
    sync_memcpy: AtomicU64,
    work_allocations: AtomicU64,
    skipped_clears: AtomicU64,
    purges: AtomicU64,
}

/// Snapshot of the migration counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrateStats {
    pub accel_submits: u64,
    /// Engine moves that completed without a fallback.
    pub irq_completions: u64,
    /// CPU copies run on the worker pool after an engine failure.
    pub worker_fallbacks: u64,
    /// CPU copies run inline.
    pub sync_memcpy: u64,
    pub work_allocations: u64,
    pub skipped_clears: u64,
    pub purges: u64,
}

#[derive(Debug)]
pub struct MigrationEngine {
    gt: Arc<Gt>,
    engine: Option<Arc<dyn CopyEngine>>,
    stats: Arc<Counters>,
}

impl MigrationEngine {
    #[must_use]
    pub fn new(gt: Arc<Gt>, engine: Option<Arc<dyn CopyEngine>>) -> Self {
        Self {
            gt,
            engine,
            stats: Arc::new(Counters::default()),
        }
    }

    #[must_use]
    pub fn engine(&self) -> Option<&Arc<dyn CopyEngine>> {
        self.engine.as_ref()
    }

    #[must_use]
    pub fn stats(&self) -> MigrateStats {
        let s = &self.stats;
        MigrateStats {
            accel_submits: s.accel_submits.load(Ordering::Relaxed),
            irq_completions: s.irq_completions.load(Ordering::Relaxed),
            worker_fallbacks: s.worker_fallbacks.load(Ordering::Relaxed),
            sync_memcpy: s.sync_memcpy.load(Ordering::Relaxed),
            work_allocations: s.work_allocations.load(Ordering::Relaxed),
            skipped_clears: s.skipped_clears.load(Ordering::Relaxed),
            purges: s.purges.load(Ordering::Relaxed),
        }
    }

    /// Moves `obj` into `dst_region`.
    ///
    /// With `evict`, the destination need not be one of the object's
    /// placements; the object's home region is then left as it was. On error
    /// the object keeps its previous placement.
    ///
    /// # Errors
    /// - `InvalidArgument` for a region outside the placements without
    ///   `evict`.
    /// - `Busy` if the object's pages are pinned.
    /// - `NoSpace` if the destination region is full.
    /// - `Interrupted` if a dependency wait was aborted.
    /// - The error of a previous move or pending access.
    pub fn move_object(
        &self,
        obj: &Arc<BufferObject>,
        dst_region: &Arc<MemoryRegion>,
        evict: bool,
        ctx: &OperationCtx,
    ) -> VmaResult<()> {
        might_sleep();
        let in_placements = obj
            .placements()
            .iter()
            .any(|r| Arc::ptr_eq(r, dst_region));
        if !evict && !in_placements {
            return Err(VmaError::InvalidArgument(format!(
                "region {} is not a placement of object {}",
                dst_region.name(),
                obj.id()
            )));
        }

        let mut st = obj.lock();
        if Arc::ptr_eq(st.resource.region(), dst_region) {
            return Ok(());
        }

        obj.unbind(UnbindFlags::ACTIVE | UnbindFlags::ASYNC, ctx)?;
        obj.put_pages_locked(&mut st)?;

        if st.madv != Madvise::WillNeed {
            return self.purge(obj, &mut st);
        }

        let dst = Resource::new(dst_region, obj.size())?;
        if !dst.cpu_maps_iomem() {
            dst.populate()?;
        }
        let io_sgt = if dst.cpu_maps_iomem() {
            Some(dst.sg_table()?)
        } else {
            None
        };

        let src = st.resource.clone();
        let clear = !src.cpu_maps_iomem() && !src.is_populated();

        let fence = if clear && !obj.flags().contains(ObjectFlags::ZERO_ALLOC) {
            self.stats.skipped_clears.fetch_add(1, Ordering::Relaxed);
            log::trace!("object {}: nothing to copy or clear", obj.id());
            None
        } else {
            let mut deps = DependencySet::new();
            deps.add_dependency(st.moving.as_ref(), DepKind::Moving)?;
            deps.add_reservation(obj.resv())?;

            let arg = MemcpyArg {
                clear,
                num_pages: obj.num_pages(),
                dst: dst.clone(),
                src: src.clone(),
            };
            self.do_move(arg, &deps, true, ctx)?
        };

        // Committed from here on.
        let old = std::mem::replace(&mut st.resource, dst.clone());
        match &fence {
            Some(fence) => {
                obj.resv().add_exclusive(fence);
                self.release_after(fence, old);
            }
            None => drop(old),
        }
        st.moving = fence;

        if in_placements {
            st.region = dst_region.clone();
        }
        st.mem_flags = mem_flags_for(&dst);
        st.cache_level = dst.cache_level(self.gt.has_llc());
        st.read_domains = domains_for(&dst);
        st.write_domain = domains_for(&dst);
        st.cached_io_sgt = io_sgt;

        log::debug!(
            "object {}: moved to {}{}",
            obj.id(),
            dst_region.name(),
            if st.moving.is_some() { " (async)" } else { "" }
        );
        Ok(())
    }

    /// Copies `src` into `dst` without changing either placement. The copy's
    /// fence, if it is still running, is published as a writer on `dst` and
    /// a reader on `src`.
    ///
    /// # Errors
    /// `InvalidArgument` for different sizes or the same object; dependency
    /// and population errors otherwise.
    pub fn copy_object(
        &self,
        dst: &Arc<BufferObject>,
        src: &Arc<BufferObject>,
        allow_accel: bool,
        ctx: &OperationCtx,
    ) -> VmaResult<Option<Fence>> {
        might_sleep();
        if Arc::ptr_eq(dst, src) || dst.size() != src.size() {
            return Err(VmaError::InvalidArgument(format!(
                "cannot copy object {} into object {}",
                src.id(),
                dst.id()
            )));
        }

        let (dst_st, src_st) = if dst.id() < src.id() {
            let d = dst.lock();
            (d, src.lock())
        } else {
            let s = src.lock();
            (dst.lock(), s)
        };

        dst_st.resource.populate()?;
        src_st.resource.populate()?;

        let mut deps = DependencySet::new();
        deps.add_dependency(dst_st.moving.as_ref(), DepKind::Moving)?;
        deps.add_dependency(src_st.moving.as_ref(), DepKind::Moving)?;
        deps.add_reservation(dst.resv())?;
        deps.add_dependency(src.resv().fences().0.as_ref(), DepKind::Exclusive)?;

        let arg = MemcpyArg {
            clear: false,
            num_pages: dst.num_pages(),
            dst: dst_st.resource.clone(),
            src: src_st.resource.clone(),
        };
        let fence = self.do_move(arg, &deps, allow_accel, ctx)?;

        if let Some(fence) = &fence {
            dst.resv().add_exclusive(fence);
            src.resv().add_shared(fence);
        }
        Ok(fence)
    }

    /// Discards the contents: the object gets fresh, unpopulated system
    /// backing and is marked purged.
    fn purge(&self, obj: &BufferObject, st: &mut ObjectState) -> VmaResult<()> {
        let fresh = Resource::new(self.gt.system_region(), obj.size())?;
        let old = std::mem::replace(&mut st.resource, fresh);

        let mut busy = DependencySet::new();
        let (exclusive, shared) = obj.resv().fences();
        for fence in exclusive.iter().chain(&shared) {
            // Failed users have retired all the same.
            let _ = busy.add_dependency(Some(fence), DepKind::Shared);
        }
        let workers = self.gt.workers().clone();
        busy.when_all(move |_| workers.queue_work(Box::new(move || drop(old))));

        st.madv = Madvise::Purged;
        st.moving = None;
        st.cached_io_sgt = None;
        st.mem_flags = mem_flags_for(&st.resource);
        st.cache_level = st.resource.cache_level(self.gt.has_llc());
        self.stats.purges.fetch_add(1, Ordering::Relaxed);
        log::debug!("object {}: purged", obj.id());
        Ok(())
    }

    /// Releases `old` once `fence` has signalled, from the worker pool.
    fn release_after(&self, fence: &Fence, old: Arc<Resource>) {
        let workers = self.gt.workers().clone();
        // Already signalled: the closure, and `old` with it, is dropped here.
        fence.add_callback(move |_| {
            workers.queue_work(Box::new(move || drop(old)));
        });
    }

    fn accel_move(
        &self,
        arg: &MemcpyArg,
        deps: &DependencySet,
        fail_gpu: bool,
    ) -> VmaResult<Fence> {
        let engine = self
            .engine
            .as_ref()
            .filter(|e| !e.is_wedged())
            .ok_or(VmaError::DeviceWedged)?;

        let dst_sg = arg.dst.sg_table()?;
        let dst_lmem = arg.dst.gtt_binds_lmem();
        let (fence, result) = if arg.clear || fail_gpu {
            engine.submit_clear(
                deps,
                &dst_sg,
                arg.dst.cache_level(self.gt.has_llc()),
                dst_lmem,
            )
        } else {
            let src_sg = arg.src.sg_table()?;
            engine.submit_copy(deps, &src_sg, arg.src.gtt_binds_lmem(), &dst_sg, dst_lmem)
        };

        match (fence, result) {
            (Some(fence), Ok(())) => {
                self.stats.accel_submits.fetch_add(1, Ordering::Relaxed);
                Ok(fence)
            }
            (None, Ok(())) => Ok(Fence::stub()),
            (Some(fence), Err(err)) => {
                // The request may still touch the destination.
                let _ = fence.wait();
                Err(err)
            }
            (None, Err(err)) => Err(err),
        }
    }

    /// Runs one move or clear. Returns the fence of work still in flight, or
    /// `None` if the destination is complete already.
    fn do_move(
        &self,
        arg: MemcpyArg,
        deps: &DependencySet,
        allow_accel: bool,
        ctx: &OperationCtx,
    ) -> VmaResult<Option<Fence>> {
        let fail_gpu = selftest::fail_gpu_migration();
        let fail_alloc = selftest::fail_work_allocation();

        let accel = if allow_accel {
            self.accel_move(&arg, deps, fail_gpu)
        } else {
            Err(VmaError::InvalidArgument("accelerated move not allowed".into()))
        };

        match accel {
            Ok(dep) => {
                // System pages come back zeroed from the allocator, so only
                // local destinations need the fallback armed.
                if !arg.dst.gtt_binds_lmem() && !fail_gpu && !fail_alloc {
                    return Ok(Some(dep));
                }

                let outcome = if fail_alloc {
                    let waited = dep.wait();
                    if fail_gpu {
                        Err(VmaError::InvalidArgument("forced gpu migration failure".into()))
                    } else {
                        waited
                    }
                } else {
                    self.stats.work_allocations.fetch_add(1, Ordering::Relaxed);
                    match memcpy::arm(arg.clone(), &dep, self.gt.workers(), &self.stats, fail_gpu)
                    {
                        Armed::Pending(fence) => return Ok(Some(fence)),
                        Armed::Signalled(outcome) => outcome,
                    }
                };

                match outcome {
                    Ok(()) => return Ok(None),
                    Err(err) => log::debug!("accelerated move failed ({err}), copying on the cpu"),
                }
            }
            Err(err @ (VmaError::Interrupted | VmaError::Busy)) => return Err(err),
            Err(err) => {
                log::trace!("no accelerated move ({err})");
                deps.sync(ctx)?;
            }
        }

        self.stats.sync_memcpy.fetch_add(1, Ordering::Relaxed);
        arg.run()?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::context::Device;
    use crate::mem::{CacheLevel, SgTable};
    use crate::utils::GTT_PAGE_SIZE;

    /// Accepts the request, then reports a failed submission.
    #[derive(Debug)]
    struct BrokenEngine;

    impl CopyEngine for BrokenEngine {
        fn is_wedged(&self) -> bool {
            false
        }

        fn submit_clear(
            &self,
            _deps: &DependencySet,
            _dst: &Arc<SgTable>,
            _cache_level: CacheLevel,
            _dst_lmem: bool,
        ) -> (Option<Fence>, VmaResult<()>) {
            (Some(Fence::stub()), Err(VmaError::HardwareFault(-1)))
        }

        fn submit_copy(
            &self,
            _deps: &DependencySet,
            _src: &Arc<SgTable>,
            _src_lmem: bool,
            _dst: &Arc<SgTable>,
            _dst_lmem: bool,
        ) -> (Option<Fence>, VmaResult<()>) {
            (Some(Fence::stub()), Err(VmaError::HardwareFault(-1)))
        }
    }

    fn object(dev: &Device) -> Arc<BufferObject> {
        let placements = [
            dev.system_region().clone(),
            dev.local_region().unwrap().clone(),
        ];
        let obj = dev
            .create_object(GTT_PAGE_SIZE, &placements, ObjectFlags::empty())
            .unwrap();
        obj.cpu_write(0, b"payload").unwrap();
        obj
    }

    #[test]
    fn test_submission_error_copies_inline() {
        let config = DeviceConfig::new().lmem(1 << 20);
        let dev = Device::with_engine(config, Some(Arc::new(BrokenEngine))).unwrap();
        let obj = object(&dev);
        let local = dev.local_region().unwrap().clone();

        dev.migrate()
            .move_object(&obj, &local, false, &OperationCtx::new())
            .unwrap();
        assert!(obj.is_lmem());
        assert!(obj.moving_fence().is_none());

        let mut back = [0u8; 7];
        obj.cpu_read(0, &mut back).unwrap();
        assert_eq!(&back, b"payload");
        assert_eq!(
            dev.migrate().stats(),
            MigrateStats {
                sync_memcpy: 1,
                ..MigrateStats::default()
            }
        );
    }

    #[test]
    fn test_failed_previous_move_aborts() {
        let dev = Device::new(DeviceConfig::new().lmem(1 << 20).accel(false)).unwrap();
        let obj = object(&dev);
        let before = obj.resource();
        obj.lock().moving = Some(Fence::failed("move", VmaError::HardwareFault(-2)));

        let local = dev.local_region().unwrap().clone();
        assert_eq!(
            dev.migrate()
                .move_object(&obj, &local, false, &OperationCtx::new()),
            Err(VmaError::HardwareFault(-2))
        );
        assert!(Arc::ptr_eq(&obj.resource(), &before));
    }

    #[test]
    fn test_interrupted_wait_leaves_object() {
        use std::sync::atomic::AtomicBool;

        let dev = Device::new(DeviceConfig::new().lmem(1 << 20).accel(false)).unwrap();
        let obj = object(&dev);
        let gate = Fence::new("gpu");
        obj.resv().add_shared(&gate);

        let flag = Arc::new(AtomicBool::new(true));
        let ctx = OperationCtx::new().interruptible(flag);
        let local = dev.local_region().unwrap().clone();
        assert_eq!(
            dev.migrate().move_object(&obj, &local, false, &ctx),
            Err(VmaError::Interrupted)
        );
        assert!(!obj.is_lmem());
        gate.signal(Ok(()));
    }
}
