use gem_vma::mem::CacheLevel;
use gem_vma::object::{Domains, MemFlags};
use gem_vma::utils::GTT_PAGE_SIZE;
use gem_vma::{
    BufferObject, Device, DeviceConfig, Madvise, ObjectFlags, OperationCtx, PinRequest, VmaError,
    instance,
};
use std::sync::Arc;

const PAGE: u64 = GTT_PAGE_SIZE;

fn device(accel: bool) -> Arc<Device> {
    Device::new(
        DeviceConfig::new()
            .ggtt_size(1 << 24)
            .lmem(1 << 20)
            .accel(accel),
    )
    .unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// A two-page object in system memory that may also live in local memory,
/// filled with a known pattern.
fn filled_object(dev: &Device, seed: u8) -> (Arc<BufferObject>, Vec<u8>) {
    let placements = [
        dev.system_region().clone(),
        dev.local_region().unwrap().clone(),
    ];
    let obj = dev
        .create_object(2 * PAGE, &placements, ObjectFlags::empty())
        .unwrap();
    let data = pattern((2 * PAGE) as usize, seed);
    obj.cpu_write(0, &data).unwrap();
    (obj, data)
}

fn contents(obj: &BufferObject) -> Vec<u8> {
    let mut buf = vec![0u8; obj.size() as usize];
    obj.cpu_read(0, &mut buf).unwrap();
    buf
}

#[test]
fn test_move_to_local_and_back() {
    let dev = device(true);
    let local = dev.local_region().unwrap().clone();
    let (obj, data) = filled_object(&dev, 3);
    let ctx = OperationCtx::new();

    dev.migrate().move_object(&obj, &local, false, &ctx).unwrap();
    assert!(Arc::ptr_eq(&obj.region(), &local));
    assert!(obj.is_lmem());
    assert_eq!(obj.mem_flags(), MemFlags::IOMEM);
    assert_eq!(obj.cache_level(), CacheLevel::None);
    assert_eq!(obj.domains(), (Domains::WC, Domains::WC));
    assert!(obj.cached_io_sgt().is_some());
    assert_eq!(contents(&obj), data);

    let stats = dev.migrate().stats();
    assert_eq!(stats.accel_submits, 1);
    assert_eq!(stats.work_allocations, 1);

    let system = dev.system_region().clone();
    dev.migrate().move_object(&obj, &system, false, &ctx).unwrap();
    assert!(Arc::ptr_eq(&obj.region(), &system));
    assert_eq!(obj.mem_flags(), MemFlags::STRUCT_PAGE);
    assert_eq!(obj.cache_level(), CacheLevel::Llc);
    assert!(obj.cached_io_sgt().is_none());
    assert_eq!(contents(&obj), data);
    assert_eq!(dev.migrate().stats().accel_submits, 2);
}

#[test]
fn test_move_to_current_region_is_noop() {
    let dev = device(true);
    let (obj, _) = filled_object(&dev, 1);
    let before = obj.resource();
    let ctx = OperationCtx::new();

    // Bindings survive, even pinned ones.
    let vma = instance(&obj, dev.ggtt(), None).unwrap();
    vma.pin(&PinRequest::new().global(), &ctx).unwrap();
    let node = vma.node();
    dev.migrate()
        .move_object(&obj, &dev.system_region().clone(), false, &ctx)
        .unwrap();
    assert!(Arc::ptr_eq(&obj.resource(), &before));
    assert_eq!(vma.node(), node);
    assert!(vma.is_pinned());
    vma.unpin();
    assert_eq!(dev.migrate().stats().accel_submits, 0);
}

#[test]
fn test_cpu_copy_without_engine() {
    let dev = device(false);
    let local = dev.local_region().unwrap().clone();
    let (obj, data) = filled_object(&dev, 9);

    dev.migrate()
        .move_object(&obj, &local, false, &OperationCtx::new())
        .unwrap();
    assert!(obj.moving_fence().is_none());
    assert_eq!(contents(&obj), data);

    let stats = dev.migrate().stats();
    assert_eq!(stats.sync_memcpy, 1);
    assert_eq!(stats.accel_submits, 0);
}

#[test]
fn test_wedged_engine_copies_synchronously() {
    let dev = device(true);
    dev.blitter().unwrap().set_wedged(true);
    let local = dev.local_region().unwrap().clone();
    let (obj, data) = filled_object(&dev, 5);

    dev.migrate()
        .move_object(&obj, &local, false, &OperationCtx::new())
        .unwrap();
    assert!(obj.moving_fence().is_none());
    assert_eq!(contents(&obj), data);
    assert_eq!(dev.migrate().stats().sync_memcpy, 1);
}

#[test]
fn test_engine_fault_falls_back_to_cpu() {
    let dev = device(true);
    let local = dev.local_region().unwrap().clone();
    let (obj, data) = filled_object(&dev, 7);

    dev.blitter().unwrap().inject_fault(-5);
    dev.migrate()
        .move_object(&obj, &local, false, &OperationCtx::new())
        .unwrap();
    assert_eq!(contents(&obj), data);

    // Depending on when the engine fails, the copy runs on a worker or
    // inline; either way it runs exactly once.
    let stats = dev.migrate().stats();
    assert_eq!(stats.worker_fallbacks + stats.sync_memcpy, 1);
    assert_eq!(stats.irq_completions, 0);
}

#[test]
fn test_eviction_keeps_home_region() {
    let dev = device(true);
    let system = dev.system_region().clone();
    let local = dev.local_region().unwrap().clone();
    let obj = dev
        .create_object(PAGE, &[system.clone()], ObjectFlags::empty())
        .unwrap();
    obj.cpu_write(0, b"evicted").unwrap();
    let ctx = OperationCtx::new();

    assert!(matches!(
        dev.migrate().move_object(&obj, &local, false, &ctx),
        Err(VmaError::InvalidArgument(_))
    ));
    assert!(!obj.is_lmem());

    dev.migrate().move_object(&obj, &local, true, &ctx).unwrap();
    assert!(obj.is_lmem());
    assert!(Arc::ptr_eq(&obj.region(), &system));
    assert!(Arc::ptr_eq(obj.resource().region(), &local));

    let mut back = [0u8; 7];
    obj.cpu_read(0, &mut back).unwrap();
    assert_eq!(&back, b"evicted");
}

#[test]
fn test_failed_move_keeps_placement() {
    let dev = device(true);
    let local = dev.local_region().unwrap().clone();
    let (obj, data) = filled_object(&dev, 11);
    let before = obj.resource();
    let ctx = OperationCtx::new();

    let vma = instance(&obj, dev.ggtt(), None).unwrap();
    vma.pin(&PinRequest::new().global(), &ctx).unwrap();
    assert_eq!(
        dev.migrate().move_object(&obj, &local, false, &ctx),
        Err(VmaError::Busy)
    );
    assert!(Arc::ptr_eq(&obj.resource(), &before));
    assert!(!obj.is_lmem());
    vma.unpin();

    // Local memory too small for the object.
    let tiny = Device::new(DeviceConfig::new().lmem(PAGE).accel(true)).unwrap();
    let placements = [
        tiny.system_region().clone(),
        tiny.local_region().unwrap().clone(),
    ];
    let big = tiny
        .create_object(2 * PAGE, &placements, ObjectFlags::empty())
        .unwrap();
    big.cpu_write(0, &data).unwrap();
    let before = big.resource();
    assert_eq!(
        tiny.migrate().move_object(&big, &placements[1], false, &ctx),
        Err(VmaError::NoSpace)
    );
    assert!(Arc::ptr_eq(&big.resource(), &before));
    assert_eq!(contents(&big), data);
}

#[test]
fn test_unbinds_before_moving() {
    let dev = device(true);
    let local = dev.local_region().unwrap().clone();
    let (obj, data) = filled_object(&dev, 13);
    let ctx = OperationCtx::new();

    let vma = instance(&obj, dev.ggtt(), None).unwrap();
    vma.pin(&PinRequest::new().global(), &ctx).unwrap();
    vma.unpin();

    dev.migrate().move_object(&obj, &local, false, &ctx).unwrap();
    assert!(vma.node().is_none());

    // Rebinding waits for the move and maps local pages.
    vma.pin(&PinRequest::new().global(), &ctx).unwrap();
    vma.wait_for_bind(&ctx).unwrap();
    let node = vma.node().unwrap();
    assert_eq!(
        dev.ggtt().translate(node.start),
        vma.pages().unwrap().page_dma(0)
    );
    vma.unpin();
    assert_eq!(contents(&obj), data);
}

#[test]
fn test_purgeable_object_is_discarded() {
    let dev = device(true);
    let local = dev.local_region().unwrap().clone();
    let (obj, _) = filled_object(&dev, 17);

    assert_eq!(obj.set_madv(Madvise::DontNeed), Madvise::DontNeed);
    dev.migrate()
        .move_object(&obj, &local, false, &OperationCtx::new())
        .unwrap();

    assert_eq!(obj.madv(), Madvise::Purged);
    assert!(!obj.is_lmem());
    assert!(!obj.resource().is_populated());
    assert!(matches!(obj.pin_pages(), Err(VmaError::InvalidArgument(_))));

    let stats = dev.migrate().stats();
    assert_eq!(stats.purges, 1);
    assert_eq!(stats.accel_submits, 0);
}

#[test]
fn test_unpopulated_object_skips_clear() {
    let dev = device(true);
    let placements = [
        dev.system_region().clone(),
        dev.local_region().unwrap().clone(),
    ];
    let local = placements[1].clone();
    let ctx = OperationCtx::new();

    let lazy = dev
        .create_object(PAGE, &placements, ObjectFlags::empty())
        .unwrap();
    dev.migrate().move_object(&lazy, &local, false, &ctx).unwrap();
    assert!(lazy.is_lmem());
    assert!(lazy.moving_fence().is_none());
    let stats = dev.migrate().stats();
    assert_eq!(stats.skipped_clears, 1);
    assert_eq!(stats.accel_submits, 0);

    // Dirty the local page the zeroed object will land on.
    lazy.cpu_write(0, &[0xff; 64]).unwrap();
    drop(lazy);

    let zeroed = dev
        .create_object(PAGE, &placements, ObjectFlags::ZERO_ALLOC)
        .unwrap();
    dev.migrate().move_object(&zeroed, &local, false, &ctx).unwrap();
    assert_eq!(dev.migrate().stats().skipped_clears, 1);
    assert_eq!(dev.migrate().stats().accel_submits, 1);
    assert!(contents(&zeroed).iter().all(|&b| b == 0));
}

#[test]
fn test_copy_object() {
    let dev = device(true);
    let (src, data) = filled_object(&dev, 19);
    let dst = dev
        .create_object(2 * PAGE, &[dev.system_region().clone()], ObjectFlags::empty())
        .unwrap();
    let ctx = OperationCtx::new();

    let fence = dev.migrate().copy_object(&dst, &src, true, &ctx).unwrap();
    assert!(fence.is_some());
    assert_eq!(contents(&dst), data);
    assert_eq!(contents(&src), data);

    let small = dev
        .create_object(PAGE, &[dev.system_region().clone()], ObjectFlags::empty())
        .unwrap();
    assert!(matches!(
        dev.migrate().copy_object(&small, &src, true, &ctx),
        Err(VmaError::InvalidArgument(_))
    ));
    assert!(matches!(
        dev.migrate().copy_object(&src, &src, false, &ctx),
        Err(VmaError::InvalidArgument(_))
    ));

    let cpu = dev
        .create_object(2 * PAGE, &[dev.system_region().clone()], ObjectFlags::empty())
        .unwrap();
    assert!(dev.migrate().copy_object(&cpu, &src, false, &ctx).unwrap().is_none());
    assert_eq!(contents(&cpu), data);
}
