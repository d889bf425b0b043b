use crate::config::{DeviceConfig, VmDesc};
use crate::error::{VmaError, VmaResult};
use crate::gtt::{AddressSpace, AddressSpaceId};
use crate::mem::{MemoryRegion, RegionSet};
use crate::migrate::{Blitter, CopyEngine, MigrationEngine};
use crate::object::{BufferObject, ObjectFlags};
use crate::vma::Vma;
use crate::vma::closed::ClosedVmas;
use crate::worker::WorkerPool;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

// ===============================================================================================
// Runtime Power Management
// ===============================================================================================

/// Device wake reference counting. Anything touching the global address
/// space holds a [`Wakeref`] for its whole duration.
#[derive(Debug, Default)]
pub struct RuntimePm {
    count: AtomicUsize,
    wakeups: AtomicU64,
}

impl RuntimePm {
    #[must_use]
    pub fn get(&self) -> Wakeref<'_> {
        if self.count.fetch_add(1, Ordering::AcqRel) == 0 {
            self.wakeups.fetch_add(1, Ordering::Relaxed);
            log::trace!("gt: wake");
        }
        Wakeref { pm: self }
    }

    /// Number of wake references currently held.
    #[must_use]
    pub fn active(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }
}

/// Keeps the device awake until dropped.
#[derive(Debug)]
pub struct Wakeref<'a> {
    pm: &'a RuntimePm,
}

impl Drop for Wakeref<'_> {
    fn drop(&mut self) {
        if self.pm.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            log::trace!("gt: idle");
        }
    }
}

// ===============================================================================================
// Fence Registers
// ===============================================================================================

#[derive(Debug, Default)]
struct FenceReg {
    owner: Option<Weak<Vma>>,
    pin: u32,
}

impl FenceReg {
    fn is_owned_by(&self, vma: &Vma) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), vma))
    }

    fn is_free(&self) -> bool {
        self.owner.as_ref().is_none_or(|w| w.strong_count() == 0)
    }
}

/// Pool of detiling fence registers for mappable global VMAs.
#[derive(Debug)]
pub struct FenceRegisters {
    regs: Mutex<Vec<FenceReg>>,
}

impl FenceRegisters {
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            regs: Mutex::new((0..count).map(|_| FenceReg::default()).collect()),
        }
    }

    /// Registers that are free or could be stolen.
    #[must_use]
    pub fn available(&self) -> usize {
        self.regs
            .lock()
            .iter()
            .filter(|r| r.is_free() || r.pin == 0)
            .count()
    }

    /// Assigns and pins a register for `vma`, stealing an unpinned one if
    /// none is free.
    pub(crate) fn pin(&self, vma: &Vma) -> VmaResult<usize> {
        let mut regs = self.regs.lock();

        if let Some(id) = vma.fence_id() {
            if let Some(reg) = regs.get_mut(id).filter(|r| r.is_owned_by(vma)) {
                reg.pin += 1;
                return Ok(id);
            }
        }

        let id = regs
            .iter()
            .position(FenceReg::is_free)
            .or_else(|| regs.iter().position(|r| r.pin == 0))
            .ok_or(VmaError::Busy)?;

        let prev = regs[id].owner.take().and_then(|w| w.upgrade());
        if let Some(prev) = &prev {
            log::debug!("fence {id}: stolen from vma at {:?}", prev.node());
            prev.clear_fence(id);
        }

        regs[id] = FenceReg {
            owner: Some(vma.weak()),
            pin: 1,
        };
        vma.set_fence(id);
        // The previous owner may be the last reference; release it unlocked.
        drop(regs);
        drop(prev);
        Ok(id)
    }

    pub(crate) fn unpin(&self, id: usize) {
        if let Some(reg) = self.regs.lock().get_mut(id) {
            debug_assert!(reg.pin > 0, "fence {id} unpinned too often");
            reg.pin = reg.pin.saturating_sub(1);
        }
    }

    /// Detaches `vma`'s register, if it still owns one.
    pub(crate) fn release(&self, vma: &Vma) {
        let Some(id) = vma.fence_id() else {
            return;
        };
        let mut regs = self.regs.lock();
        if let Some(reg) = regs.get_mut(id).filter(|r| r.is_owned_by(vma)) {
            if reg.pin > 0 {
                log::warn!("fence {id}: released while pinned");
            }
            *reg = FenceReg::default();
        }
        vma.clear_fence(id);
    }
}

// ===============================================================================================
// GT Shared Services
// ===============================================================================================

/// Services shared by every address space, object and VMA of a device.
#[derive(Debug)]
pub struct Gt {
    config: DeviceConfig,
    workers: Arc<WorkerPool>,
    runtime_pm: RuntimePm,
    regions: Arc<RegionSet>,
    fence_regs: FenceRegisters,
    closed_vmas: ClosedVmas,
}

impl Gt {
    /// # Errors
    /// Fails if the local-memory backing cannot be mapped.
    pub fn new(config: DeviceConfig) -> VmaResult<Arc<Self>> {
        let mut regions = vec![MemoryRegion::system(0)];
        if config.lmem_size > 0 {
            regions.push(MemoryRegion::local(1, 0, config.lmem_size)?);
        }

        Ok(Arc::new(Self {
            config,
            workers: Arc::new(WorkerPool::new(config.workers)?),
            runtime_pm: RuntimePm::default(),
            regions: Arc::new(RegionSet::new(regions)),
            fence_regs: FenceRegisters::new(config.fence_registers),
            closed_vmas: ClosedVmas::default(),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[must_use]
    pub fn has_llc(&self) -> bool {
        self.config.has_llc
    }

    #[must_use]
    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    #[must_use]
    pub fn runtime_pm(&self) -> &RuntimePm {
        &self.runtime_pm
    }

    #[must_use]
    pub fn regions(&self) -> &Arc<RegionSet> {
        &self.regions
    }

    #[must_use]
    pub fn system_region(&self) -> &Arc<MemoryRegion> {
        &self.regions.regions()[0]
    }

    #[must_use]
    pub fn local_region(&self) -> Option<&Arc<MemoryRegion>> {
        self.regions.regions().iter().find(|r| r.is_local())
    }

    #[must_use]
    pub fn fence_regs(&self) -> &FenceRegisters {
        &self.fence_regs
    }

    #[must_use]
    pub fn closed_vmas(&self) -> &ClosedVmas {
        &self.closed_vmas
    }

    /// Idle point: reclaims closed VMAs. Returns how many were destroyed.
    pub fn parked(&self) -> usize {
        self.closed_vmas.park()
    }
}

// ===============================================================================================
// Device
// ===============================================================================================

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// A GPU with its global address space, memory regions and migration engine.
#[derive(Debug)]
pub struct Device {
    gt: Arc<Gt>,
    ggtt: Arc<AddressSpace>,
    migrate: MigrationEngine,
    blitter: Option<Arc<Blitter>>,
}

impl Device {
    /// Creates a device with the software copy engine if `config.accel`.
    ///
    /// # Errors
    /// Fails if memory regions or the copy engine cannot be set up.
    pub fn new(config: DeviceConfig) -> VmaResult<Arc<Self>> {
        let gt = Gt::new(config)?;
        let blitter = if config.accel {
            Some(Arc::new(Blitter::new(gt.regions().clone())?))
        } else {
            None
        };
        let engine = blitter.clone().map(|b| b as Arc<dyn CopyEngine>);
        Ok(Self::with_gt(gt, engine, blitter))
    }

    /// Creates a device around a caller-provided copy engine.
    ///
    /// # Errors
    /// Fails if memory regions cannot be set up.
    pub fn with_engine(
        config: DeviceConfig,
        engine: Option<Arc<dyn CopyEngine>>,
    ) -> VmaResult<Arc<Self>> {
        Ok(Self::with_gt(Gt::new(config)?, engine, None))
    }

    fn with_gt(
        gt: Arc<Gt>,
        engine: Option<Arc<dyn CopyEngine>>,
        blitter: Option<Arc<Blitter>>,
    ) -> Arc<Self> {
        let ggtt = AddressSpace::new(
            gt.clone(),
            AddressSpaceId::GGTT,
            &gt.config().ggtt_desc(),
            true,
        );
        let migrate = MigrationEngine::new(gt.clone(), engine);
        log::debug!(
            "device: ggtt {} MiB, lmem {} MiB, llc {}",
            gt.config().ggtt_size >> 20,
            gt.config().lmem_size >> 20,
            gt.has_llc()
        );
        Arc::new(Self {
            gt,
            ggtt,
            migrate,
            blitter,
        })
    }

    #[must_use]
    pub fn gt(&self) -> &Arc<Gt> {
        &self.gt
    }

    #[must_use]
    pub fn ggtt(&self) -> &Arc<AddressSpace> {
        &self.ggtt
    }

    #[must_use]
    pub fn migrate(&self) -> &MigrationEngine {
        &self.migrate
    }

    /// The software copy engine, if the device created one.
    #[must_use]
    pub fn blitter(&self) -> Option<&Arc<Blitter>> {
        self.blitter.as_ref()
    }

    #[must_use]
    pub fn system_region(&self) -> &Arc<MemoryRegion> {
        self.gt.system_region()
    }

    #[must_use]
    pub fn local_region(&self) -> Option<&Arc<MemoryRegion>> {
        self.gt.local_region()
    }

    /// Creates a per-process address space.
    #[must_use]
    pub fn create_vm(&self, desc: VmDesc) -> Arc<AddressSpace> {
        let id = AddressSpaceId::new(NEXT_VM_ID.fetch_add(1, Ordering::Relaxed));
        AddressSpace::new(self.gt.clone(), id, &desc, false)
    }

    /// Creates a buffer object initially placed in `placements[0]`.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size or empty placement list, `NoSpace`
    /// if local memory is exhausted.
    pub fn create_object(
        &self,
        size: u64,
        placements: &[Arc<MemoryRegion>],
        flags: ObjectFlags,
    ) -> VmaResult<Arc<BufferObject>> {
        BufferObject::new(self.gt.clone(), size, placements, flags)
    }

    /// Idle point, see [`Gt::parked`].
    pub fn parked(&self) -> usize {
        self.gt.parked()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Closed VMAs keep their address space, and thus the GT, alive.
        self.gt.closed_vmas().clear();
    }
}

// ===============================================================================================
// Global Singleton Management
// ===============================================================================================

static GLOBAL_DEVICE: Mutex<Option<Arc<Device>>> = Mutex::new(None);

/// Acquires the process-wide device, creating it from `config` on first use.
/// Later calls return the existing device and ignore `config`.
///
/// # Errors
/// Returns an error if the device cannot be created.
pub fn acquire(config: DeviceConfig) -> VmaResult<Arc<Device>> {
    let mut guard = GLOBAL_DEVICE.lock();

    if let Some(device) = guard.as_ref() {
        return Ok(device.clone());
    }

    let device = Device::new(config)?;
    *guard = Some(device.clone());
    drop(guard);

    Ok(device)
}

/// Releases the process-wide device. It is torn down once the last caller
/// drops its handle.
pub fn release() {
    let device = GLOBAL_DEVICE.lock().take();
    drop(device);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wakeref_is_balanced() {
        let pm = RuntimePm::default();
        {
            let _a = pm.get();
            let _b = pm.get();
            assert_eq!(pm.active(), 2);
        }
        assert_eq!(pm.active(), 0);
        assert_eq!(pm.wakeups(), 1);
    }

    #[test]
    fn test_device_regions() {
        let device = Device::new(DeviceConfig::new().lmem(1 << 20).accel(false)).unwrap();
        assert!(device.local_region().is_some());
        assert!(!device.system_region().is_local());
        assert!(device.ggtt().is_ggtt());
        assert_eq!(device.ggtt().id(), AddressSpaceId::GGTT);
    }

    #[test]
    fn test_acquire_returns_singleton() {
        let a = acquire(DeviceConfig::new().accel(false)).unwrap();
        let b = acquire(DeviceConfig::new()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        release();
        let c = acquire(DeviceConfig::new().accel(false)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        release();
    }
}
