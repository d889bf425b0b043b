#![allow(clippy::cast_possible_truncation)]

use crate::error::{VmaError, VmaResult};
use crate::fence::{DependencySet, Fence};
use crate::mem::{CacheLevel, RegionSet, SgTable};
use crate::utils::GTT_PAGE_SIZE;
use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

/// A GPU copy engine, as seen by the migration code.
///
/// Submissions return the request's fence together with the submission
/// outcome. A submission may fail after the request was created, in which
/// case both are returned and the fence must be waited before the
/// destination is touched again.
pub trait CopyEngine: Send + Sync + std::fmt::Debug {
    fn is_wedged(&self) -> bool;

    /// Zero-fills `dst` once `deps` have signalled.
    fn submit_clear(
        &self,
        deps: &DependencySet,
        dst: &Arc<SgTable>,
        cache_level: CacheLevel,
        dst_lmem: bool,
    ) -> (Option<Fence>, VmaResult<()>);

    /// Copies `src` to `dst` once `deps` have signalled.
    fn submit_copy(
        &self,
        deps: &DependencySet,
        src: &Arc<SgTable>,
        src_lmem: bool,
        dst: &Arc<SgTable>,
        dst_lmem: bool,
    ) -> (Option<Fence>, VmaResult<()>);
}

enum BlitOp {
    Clear { dst: Arc<SgTable> },
    Copy { src: Arc<SgTable>, dst: Arc<SgTable> },
}

struct BlitRequest {
    deps: Vec<Fence>,
    op: BlitOp,
    fault: Option<i32>,
    fence: Fence,
}

/// Software copy engine: one thread executing requests in submission order
/// through the CPU mappings of the memory regions.
pub struct Blitter {
    tx: Option<Sender<BlitRequest>>,
    thread: Option<JoinHandle<()>>,
    wedged: AtomicBool,
    fault: Mutex<Option<i32>>,
    submitted: AtomicU64,
}

impl std::fmt::Debug for Blitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blitter")
            .field("wedged", &self.is_wedged())
            .field("submitted", &self.submitted())
            .finish_non_exhaustive()
    }
}

impl Blitter {
    /// # Errors
    /// `AllocationFailure` if the engine thread cannot be spawned.
    pub fn new(regions: Arc<RegionSet>) -> VmaResult<Self> {
        let (tx, rx) = unbounded::<BlitRequest>();
        let thread = thread::Builder::new()
            .name("gem-vma-blt".to_string())
            .spawn(move || {
                while let Ok(req) = rx.recv() {
                    let outcome = execute(&regions, &req);
                    req.fence.signal(outcome);
                }
            })
            .map_err(|e| VmaError::AllocationFailure(format!("blitter thread: {e}")))?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
            wedged: AtomicBool::new(false),
            fault: Mutex::new(None),
            submitted: AtomicU64::new(0),
        })
    }

    /// Makes the next request signal `HardwareFault(code)` without touching
    /// its destination.
    pub fn inject_fault(&self, code: i32) {
        *self.fault.lock() = Some(code);
    }

    pub fn set_wedged(&self, wedged: bool) {
        self.wedged.store(wedged, Ordering::Release);
    }

    /// Requests accepted so far.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    fn submit(&self, deps: &DependencySet, op: BlitOp) -> (Option<Fence>, VmaResult<()>) {
        if self.is_wedged() {
            return (None, Err(VmaError::DeviceWedged));
        }
        let Some(tx) = self.tx.as_ref() else {
            return (None, Err(VmaError::DeviceWedged));
        };

        let fence = Fence::new("blt");
        let req = BlitRequest {
            deps: deps.iter().map(|(f, _)| f.clone()).collect(),
            op,
            fault: self.fault.lock().take(),
            fence: fence.clone(),
        };
        if tx.send(req).is_err() {
            log::warn!("blitter: engine thread gone");
            return (None, Err(VmaError::DeviceWedged));
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);
        (Some(fence), Ok(()))
    }
}

impl CopyEngine for Blitter {
    fn is_wedged(&self) -> bool {
        self.wedged.load(Ordering::Acquire)
    }

    fn submit_clear(
        &self,
        deps: &DependencySet,
        dst: &Arc<SgTable>,
        _cache_level: CacheLevel,
        _dst_lmem: bool,
    ) -> (Option<Fence>, VmaResult<()>) {
        self.submit(deps, BlitOp::Clear { dst: dst.clone() })
    }

    fn submit_copy(
        &self,
        deps: &DependencySet,
        src: &Arc<SgTable>,
        _src_lmem: bool,
        dst: &Arc<SgTable>,
        _dst_lmem: bool,
    ) -> (Option<Fence>, VmaResult<()>) {
        if src.num_pages() < dst.num_pages() {
            return (
                None,
                Err(VmaError::InvalidArgument("copy source smaller than destination".into())),
            );
        }
        self.submit(
            deps,
            BlitOp::Copy {
                src: src.clone(),
                dst: dst.clone(),
            },
        )
    }
}

impl Drop for Blitter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("blitter thread panicked");
            }
        }
    }
}

fn execute(regions: &RegionSet, req: &BlitRequest) -> VmaResult<()> {
    for dep in &req.deps {
        dep.wait()?;
    }
    if let Some(code) = req.fault {
        log::debug!("blitter: injected fault {code}");
        return Err(VmaError::HardwareFault(code));
    }

    let page = GTT_PAGE_SIZE as usize;
    let host = |sg: &SgTable, i: u64| {
        sg.page_dma(i)
            .and_then(|dma| regions.dma_to_host(dma, GTT_PAGE_SIZE))
            .ok_or_else(|| VmaError::InvalidArgument(format!("blitter: page {i} unmapped")))
    };

    match &req.op {
        BlitOp::Clear { dst } => {
            for i in 0..dst.num_pages() {
                let d = host(dst, i)?;
                unsafe { std::ptr::write_bytes(d, 0, page) };
            }
        }
        BlitOp::Copy { src, dst } => {
            for i in 0..dst.num_pages() {
                let s = host(src, i)?;
                let d = host(dst, i)?;
                unsafe { std::ptr::copy_nonoverlapping(s, d, page) };
            }
        }
    }
    Ok(())
}
