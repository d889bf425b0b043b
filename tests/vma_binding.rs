use gem_vma::object::{Domains, UnbindFlags};
use gem_vma::utils::GTT_PAGE_SIZE;
use gem_vma::vma::PlaneInfo;
use gem_vma::{
    BufferObject, Device, DeviceConfig, Fence, ObjectFlags, OperationCtx, PinRequest, View,
    VmDesc, VmaError, VmaFlags, instance,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const PAGE: u64 = GTT_PAGE_SIZE;

fn device() -> Arc<Device> {
    Device::new(
        DeviceConfig::new()
            .ggtt_size(1 << 24)
            .mappable_end(1 << 22)
            .accel(false),
    )
    .unwrap()
}

fn object(dev: &Device, pages: u64) -> Arc<BufferObject> {
    dev.create_object(pages * PAGE, &[dev.system_region().clone()], ObjectFlags::empty())
        .unwrap()
}

#[test]
fn test_concurrent_instance_is_singleton() {
    let dev = device();
    let obj = object(&dev, 4);
    let vm = dev.create_vm(VmDesc::new(1 << 24));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let (obj, vm, barrier) = (obj.clone(), vm.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                instance(&obj, &vm, None).unwrap()
            })
        })
        .collect();
    let vmas: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(vmas.iter().all(|v| Arc::ptr_eq(v, &vmas[0])));
    assert_eq!(obj.vmas().len(), 1);
    assert!(Arc::ptr_eq(&obj.lookup_vma(&vm, None).unwrap(), &vmas[0]));
}

#[test]
fn test_views_get_their_own_vma() {
    let dev = device();
    let obj = object(&dev, 4);
    let partial = View::Partial { offset: 1, size: 2 };

    let normal = instance(&obj, dev.ggtt(), None).unwrap();
    let window = instance(&obj, dev.ggtt(), Some(&partial)).unwrap();
    assert!(!Arc::ptr_eq(&normal, &window));
    assert_eq!(window.size(), 2 * PAGE);
    assert!(Arc::ptr_eq(
        &instance(&obj, dev.ggtt(), Some(&partial)).unwrap(),
        &window
    ));
    assert_eq!(obj.ggtt_vmas().len(), 2);

    let vm = dev.create_vm(VmDesc::new(1 << 24));
    assert!(matches!(
        instance(&obj, &vm, Some(&partial)),
        Err(VmaError::InvalidArgument(_))
    ));
    assert!(matches!(
        instance(&obj, dev.ggtt(), Some(&View::Partial { offset: 3, size: 2 })),
        Err(VmaError::InvalidArgument(_))
    ));
}

#[test]
fn test_vma_larger_than_vm() {
    let dev = device();
    let obj = object(&dev, 8);
    let vm = dev.create_vm(VmDesc::new(4 * PAGE));
    assert_eq!(instance(&obj, &vm, None).err(), Some(VmaError::NoSpace));
}

#[test]
fn test_sync_global_and_local_bind() {
    let dev = device();
    let obj = object(&dev, 2);
    let vma = instance(&obj, dev.ggtt(), None).unwrap();
    let ctx = OperationCtx::new();

    vma.pin(&PinRequest::new().global().user(), &ctx).unwrap();
    assert_eq!(vma.pin_count(), 1);
    assert!(vma.flags().contains(VmaFlags::BIND_MASK));
    assert!(vma.active().exclusive().is_none());

    let node = vma.node().unwrap();
    assert_eq!(dev.ggtt().translate(node.start + PAGE), vma.pages().unwrap().page_dma(1));
    vma.unpin();
}

#[test]
fn test_unbind_refused_while_pinned() {
    let dev = device();
    let obj = object(&dev, 1);
    let vm = dev.create_vm(VmDesc::new(1 << 24));
    let vma = instance(&obj, &vm, None).unwrap();
    let ctx = OperationCtx::new();

    vma.pin(&PinRequest::new().user(), &ctx).unwrap();
    assert_eq!(vma.unbind(&ctx), Err(VmaError::Busy));
    assert_eq!(vma.unbind_async(false), Err(VmaError::Busy));
    assert_eq!(obj.unbind(UnbindFlags::ACTIVE, &ctx), Err(VmaError::Busy));
    assert!(vma.node().is_some());

    vma.unpin();
    vma.unbind(&ctx).unwrap();
    assert!(vma.node().is_none());
    assert_eq!(obj.pages_pin_count(), 0);
}

#[test]
fn test_nonblock_pin_on_contended_vm() {
    let dev = device();
    let obj = object(&dev, 1);
    let vm = dev.create_vm(VmDesc::new(1 << 24));
    let vma = instance(&obj, &vm, None).unwrap();
    let ctx = OperationCtx::new();

    let guard = vm.lock();
    assert_eq!(vma.pin(&PinRequest::new().user().nonblock(), &ctx), Err(VmaError::Busy));
    drop(guard);
    vma.pin(&PinRequest::new().user().nonblock(), &ctx).unwrap();
    vma.unpin();
}

#[test]
fn test_fixed_and_bias_placement() {
    let dev = device();
    let vm = dev.create_vm(VmDesc::new(1 << 24));
    let a = instance(&object(&dev, 2), &vm, None).unwrap();
    let b = instance(&object(&dev, 2), &vm, None).unwrap();
    let ctx = OperationCtx::new();

    a.pin(&PinRequest::new().user().fixed(16 * PAGE), &ctx).unwrap();
    assert_eq!(a.offset(), Some(16 * PAGE));

    assert!(matches!(
        b.pin(&PinRequest::new().user().fixed(PAGE + 1), &ctx),
        Err(VmaError::InvalidArgument(_))
    ));
    b.pin(&PinRequest::new().user().bias(1 << 20), &ctx).unwrap();
    assert!(b.offset().unwrap() >= 1 << 20);

    a.unpin();
    b.unpin();
}

#[test]
fn test_pin_evicts_idle_vmas() {
    let dev = Device::new(
        DeviceConfig::new()
            .ggtt_size(16 * PAGE)
            .mappable_end(16 * PAGE)
            .accel(false),
    )
    .unwrap();
    let ctx = OperationCtx::new();
    let vmas: Vec<_> = (0..3)
        .map(|_| instance(&object(&dev, 8), dev.ggtt(), None).unwrap())
        .collect();

    vmas[0].pin(&PinRequest::new().global(), &ctx).unwrap();
    vmas[1].pin(&PinRequest::new().global(), &ctx).unwrap();
    assert_eq!(
        vmas[2].pin(&PinRequest::new().global().noevict(), &ctx),
        Err(VmaError::NoSpace)
    );
    // Everything pinned: nothing to evict.
    assert_eq!(vmas[2].ggtt_pin(&PinRequest::new(), &ctx), Err(VmaError::NoSpace));

    vmas[0].unpin();
    vmas[2].ggtt_pin(&PinRequest::new(), &ctx).unwrap();
    assert!(vmas[0].node().is_none());
    assert!(vmas[1].node().is_some());

    vmas[1].unpin();
    vmas[2].unpin();
}

#[test]
fn test_async_unbind_orders_rebind() {
    let dev = device();
    let vm = dev.create_vm(VmDesc::new(1 << 24).bind_async(VmaFlags::LOCAL_BIND));
    let obj = object(&dev, 2);
    let vma = instance(&obj, &vm, None).unwrap();
    let ctx = OperationCtx::new();

    vma.pin(&PinRequest::new().user(), &ctx).unwrap();
    vma.wait_for_bind(&ctx).unwrap();
    let first = vma.node().unwrap();
    vma.unpin();

    let gpu = Fence::new("gpu");
    vma.move_to_active(&gpu, false);
    let unbind = vma.unbind_async(false).unwrap().unwrap();
    assert!(vma.node().is_none());
    assert!(!unbind.is_signaled());
    // The range is free again, but its entries stay until the user retires.
    assert!(vm.translate(first.start).is_some());

    vma.pin(&PinRequest::new().user(), &ctx).unwrap();
    let bind = vma.active().exclusive().unwrap();
    assert!(!bind.is_signaled());

    gpu.signal(Ok(()));
    unbind.wait().unwrap();
    vma.wait_for_bind(&ctx).unwrap();
    let node = vma.node().unwrap();
    assert!(vm.translate(node.start + PAGE).is_some());
    vma.unpin();
}

#[test]
fn test_active_vma_tracks_reservation() {
    let dev = device();
    let obj = object(&dev, 1);
    let vm = dev.create_vm(VmDesc::new(1 << 24));
    let vma = instance(&obj, &vm, None).unwrap();
    let ctx = OperationCtx::new();

    vma.pin(&PinRequest::new().user(), &ctx).unwrap();
    let gpu = Fence::new("gpu");
    vma.move_to_active(&gpu, true);
    vma.unpin();

    assert!(vma.is_active());
    assert!(obj.resv().fences().0.is_some());
    assert_eq!(obj.domains().1, Domains::GTT);
    assert_eq!(obj.unbind(UnbindFlags::empty(), &ctx), Err(VmaError::Busy));

    gpu.signal(Ok(()));
    vma.sync(&ctx).unwrap();
    assert!(!vma.is_active());
    obj.unbind(UnbindFlags::empty(), &ctx).unwrap();
    assert!(vma.node().is_none());
}

#[test]
fn test_rotated_view_maps_columns() {
    let dev = device();
    let obj = object(&dev, 4);
    let ctx = OperationCtx::new();
    let view = View::Rotated {
        planes: [PlaneInfo::new(0, 2, 2, 2).dst_stride(2), PlaneInfo::default()],
    };

    let normal = instance(&obj, dev.ggtt(), None).unwrap();
    let rotated = instance(&obj, dev.ggtt(), Some(&view)).unwrap();
    normal.pin(&PinRequest::new().global(), &ctx).unwrap();
    rotated.pin(&PinRequest::new().global(), &ctx).unwrap();

    let pages = normal.pages().unwrap();
    let start = rotated.node().unwrap().start;
    let ggtt = dev.ggtt();
    assert_eq!(ggtt.translate(start), pages.page_dma(2));
    assert_eq!(ggtt.translate(start + PAGE), pages.page_dma(0));
    assert_eq!(ggtt.translate(start + 2 * PAGE), pages.page_dma(3));
    assert_eq!(ggtt.translate(start + 3 * PAGE), pages.page_dma(1));

    normal.unpin();
    rotated.unpin();
}

#[test]
fn test_iomap_writes_through_aperture() {
    let dev = device();
    let obj = object(&dev, 2);
    let vma = instance(&obj, dev.ggtt(), None).unwrap();
    let ctx = OperationCtx::new();

    vma.pin(&PinRequest::new().global().mappable(), &ctx).unwrap();
    let map = vma.pin_iomap(&ctx).unwrap();
    assert_eq!(vma.pin_count(), 2);

    let data: Vec<u8> = (1..=16).collect();
    map.write(PAGE - 8, &data).unwrap();
    assert!(vma.flags().contains(VmaFlags::GGTT_WRITE));
    assert!(map.write(2 * PAGE - 4, &data).is_err());

    let mut back = vec![0u8; 16];
    obj.cpu_read(PAGE - 8, &mut back).unwrap();
    assert_eq!(back, data);

    drop(map);
    assert_eq!(vma.pin_count(), 1);
    vma.unpin();
}

#[test]
fn test_iomap_needs_mappable_binding() {
    let dev = device();
    let obj = object(&dev, 1);
    let vma = instance(&obj, dev.ggtt(), None).unwrap();
    let ctx = OperationCtx::new();

    vma.pin(&PinRequest::new().global().bias(1 << 23), &ctx).unwrap();
    assert!(matches!(vma.pin_iomap(&ctx), Err(VmaError::InvalidArgument(_))));
    vma.unpin();
}

#[test]
fn test_closed_vma_reclaimed_at_park() {
    let dev = device();
    let obj = object(&dev, 1);
    let vm = dev.create_vm(VmDesc::new(1 << 24));
    let ctx = OperationCtx::new();

    let vma = instance(&obj, &vm, None).unwrap();
    vma.pin(&PinRequest::new().user(), &ctx).unwrap();
    vma.unpin();
    vma.close();

    // The object lock is held elsewhere: stays queued.
    let guard = obj.lock();
    assert_eq!(dev.parked(), 0);
    drop(guard);

    assert_eq!(dev.parked(), 1);
    assert!(vma.node().is_none());
    assert!(obj.lookup_vma(&vm, None).is_none());
}

#[test]
fn test_reopen_races_park() {
    let dev = device();
    let obj = object(&dev, 1);
    let vm = dev.create_vm(VmDesc::new(1 << 24));
    let ctx = OperationCtx::new();
    let stop = Arc::new(AtomicBool::new(false));

    let parker = {
        let (gt, stop) = (dev.gt().clone(), stop.clone());
        thread::spawn(move || {
            let mut destroyed = 0;
            while !stop.load(Ordering::Acquire) {
                destroyed += gt.parked();
            }
            destroyed
        })
    };

    for _ in 0..2000 {
        let vma = instance(&obj, &vm, None).unwrap();
        vma.pin(&PinRequest::new().user(), &ctx).unwrap();
        let registered = obj.lookup_vma(&vm, None).unwrap();
        assert!(Arc::ptr_eq(&registered, &vma));
        assert!(vma.node().is_some());
        vma.unpin();
        vma.close();
    }
    stop.store(true, Ordering::Release);
    parker.join().unwrap();

    dev.parked();
    assert!(obj.vmas().is_empty());
    assert!(vm.lock().nodes().is_empty());
}

#[test]
fn test_oversized_rotated_view_rejected() {
    let dev = device();
    let obj = dev
        .create_object((1 << 32) + PAGE, &[dev.system_region().clone()], ObjectFlags::empty())
        .unwrap();
    let plane = PlaneInfo::new(0, (1 << 20) + 1, 1, (1 << 20) + 1).dst_stride(u32::MAX);
    let view = View::Rotated {
        planes: [plane, PlaneInfo::default()],
    };
    assert_eq!(instance(&obj, dev.ggtt(), Some(&view)).err(), Some(VmaError::NoSpace));
    assert!(obj.vmas().is_empty());
}

#[test]
fn test_trylock_unbind_async_on_contended_vm() {
    let dev = device();
    let obj = object(&dev, 1);
    let vm = dev.create_vm(VmDesc::new(1 << 24));
    let vma = instance(&obj, &vm, None).unwrap();
    let ctx = OperationCtx::new();

    vma.pin(&PinRequest::new().user(), &ctx).unwrap();
    vma.unpin();

    let guard = vm.lock();
    assert_eq!(vma.unbind_async(true), Err(VmaError::Busy));
    drop(guard);
    assert!(vma.is_bound(VmaFlags::LOCAL_BIND));

    let fence = vma.unbind_async(true).unwrap().unwrap();
    fence.wait().unwrap();
    assert!(vma.node().is_none());
}

#[test]
fn test_fence_register_stolen_from_unpinned_owner() {
    let dev = Device::new(
        DeviceConfig::new()
            .ggtt_size(1 << 24)
            .mappable_end(1 << 22)
            .fence_registers(1)
            .accel(false),
    )
    .unwrap();
    let ctx = OperationCtx::new();
    let req = PinRequest::new().global().mappable();

    let a = instance(&object(&dev, 1), dev.ggtt(), None).unwrap();
    let b = instance(&object(&dev, 1), dev.ggtt(), None).unwrap();
    a.pin(&req, &ctx).unwrap();
    b.pin(&req, &ctx).unwrap();

    let id = a.pin_fence().unwrap();
    assert_eq!(b.pin_fence(), Err(VmaError::Busy));

    a.unpin_fence();
    assert_eq!(dev.gt().fence_regs().available(), 1);
    assert_eq!(b.pin_fence(), Ok(id));
    assert_eq!(a.fence_id(), None);
    assert_eq!(b.fence_id(), Some(id));
    assert_eq!(dev.gt().fence_regs().available(), 0);

    b.unpin_fence();
    a.unpin();
    b.unpin();
}
