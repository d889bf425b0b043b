use super::Counters;
use crate::error::{VmaError, VmaResult};
use crate::fence::Fence;
use crate::mem::{Resource, move_memcpy};
use crate::worker::WorkerPool;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// What a CPU copy needs: both resources and whether to clear instead.
#[derive(Debug, Clone)]
pub(crate) struct MemcpyArg {
    pub clear: bool,
    pub num_pages: u64,
    pub dst: Arc<Resource>,
    pub src: Arc<Resource>,
}

impl MemcpyArg {
    pub(crate) fn run(&self) -> VmaResult<()> {
        let dst = self.dst.kmap_iter()?;
        let src = if self.clear {
            None
        } else {
            Some(self.src.kmap_iter()?)
        };
        move_memcpy(self.clear, self.num_pages, dst.as_ref(), src.as_deref())
    }
}

/// Outcome of arming the fallback behind an accelerated move.
pub(crate) enum Armed {
    /// Signals once the move is complete, by the engine or by the CPU.
    Pending(Fence),
    /// The engine fence had already signalled; nothing was armed.
    Signalled(VmaResult<()>),
}

/// Arms a CPU copy behind `dep`. If `dep` fails, or `fail_gpu` is set, the
/// copy runs on the worker pool; otherwise the returned fence is signalled
/// from the irq-work lane.
pub(crate) fn arm(
    arg: MemcpyArg,
    dep: &Fence,
    workers: &Arc<WorkerPool>,
    stats: &Arc<Counters>,
    fail_gpu: bool,
) -> Armed {
    let fence = Fence::new("memcpy");
    let signal = fence.clone();
    let workers = workers.clone();
    let stats = stats.clone();

    let armed = dep.add_callback(move |dep| {
        if dep.error().is_some() || fail_gpu {
            stats.worker_fallbacks.fetch_add(1, Ordering::Relaxed);
            workers.queue_work(Box::new(move || {
                let outcome = arg.run();
                if let Err(err) = &outcome {
                    log::warn!("memcpy fallback failed: {err}");
                }
                signal.signal(outcome);
            }));
        } else {
            stats.irq_completions.fetch_add(1, Ordering::Relaxed);
            workers.queue_irq_work(Box::new(move || {
                signal.signal(Ok(()));
            }));
        }
    });

    if armed {
        return Armed::Pending(fence);
    }
    if fail_gpu {
        Armed::Signalled(Err(VmaError::InvalidArgument(
            "forced gpu migration failure".into(),
        )))
    } else {
        Armed::Signalled(dep.error().map_or(Ok(()), Err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryRegion;
    use crate::utils::GTT_PAGE_SIZE;

    fn arg() -> MemcpyArg {
        let system = MemoryRegion::system(0);
        let local = MemoryRegion::local(1, 0, 1 << 20).unwrap();
        let src = Resource::new(&system, GTT_PAGE_SIZE).unwrap();
        src.populate().unwrap();
        let it = src.kmap_iter().unwrap();
        unsafe { std::ptr::write_bytes(it.page_ptr(0).unwrap(), 0xa5, 32) };
        MemcpyArg {
            clear: false,
            num_pages: 1,
            dst: Resource::new(&local, GTT_PAGE_SIZE).unwrap(),
            src,
        }
    }

    fn first_byte(res: &Resource) -> u8 {
        unsafe { *res.kmap_iter().unwrap().page_ptr(0).unwrap() }
    }

    #[test]
    fn test_failed_dep_copies_on_worker() {
        let workers = Arc::new(WorkerPool::new(1).unwrap());
        let stats = Arc::new(Counters::default());
        let arg = arg();
        let dst = arg.dst.clone();

        let dep = Fence::new("blt");
        let Armed::Pending(fence) = arm(arg, &dep, &workers, &stats, false) else {
            panic!("dependency was pending");
        };
        dep.signal(Err(VmaError::HardwareFault(-5)));
        fence.wait().unwrap();

        assert_eq!(first_byte(&dst), 0xa5);
        assert_eq!(stats.worker_fallbacks.load(Ordering::Relaxed), 1);
        assert_eq!(stats.irq_completions.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_clean_dep_completes_from_irq_work() {
        let workers = Arc::new(WorkerPool::new(1).unwrap());
        let stats = Arc::new(Counters::default());

        let dep = Fence::new("blt");
        let Armed::Pending(fence) = arm(arg(), &dep, &workers, &stats, false) else {
            panic!("dependency was pending");
        };
        dep.signal(Ok(()));
        fence.wait().unwrap();
        assert_eq!(stats.irq_completions.load(Ordering::Relaxed), 1);
        assert_eq!(stats.worker_fallbacks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_signalled_dep_arms_nothing() {
        let workers = Arc::new(WorkerPool::new(1).unwrap());
        let stats = Arc::new(Counters::default());

        let failed = Fence::failed("blt", VmaError::HardwareFault(-5));
        assert!(matches!(
            arm(arg(), &failed, &workers, &stats, false),
            Armed::Signalled(Err(VmaError::HardwareFault(-5)))
        ));
        assert!(matches!(
            arm(arg(), &Fence::stub(), &workers, &stats, true),
            Armed::Signalled(Err(VmaError::InvalidArgument(_)))
        ));
        assert!(matches!(
            arm(arg(), &Fence::stub(), &workers, &stats, false),
            Armed::Signalled(Ok(()))
        ));
    }

    #[test]
    fn test_clear_ignores_source() {
        let mut arg = arg();
        arg.clear = true;
        arg.run().unwrap();
        assert_eq!(first_byte(&arg.dst), 0);
    }
}
