//! Process-wide failure switches for exercising the migration fallbacks.
//!
//! Without the `selftest` feature both switches read as off.

#[cfg(feature = "selftest")]
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "selftest")]
static FAIL_GPU_MIGRATION: AtomicBool = AtomicBool::new(false);
#[cfg(feature = "selftest")]
static FAIL_WORK_ALLOCATION: AtomicBool = AtomicBool::new(false);

/// Sets both switches. `gpu` makes every accelerated move report failure
/// (the engine clears instead of copying); `work_alloc` makes allocation of
/// the asynchronous fallback work fail.
#[cfg(feature = "selftest")]
pub fn set_failure_modes(gpu: bool, work_alloc: bool) {
    FAIL_GPU_MIGRATION.store(gpu, Ordering::SeqCst);
    FAIL_WORK_ALLOCATION.store(work_alloc, Ordering::SeqCst);
}

#[inline]
pub(crate) fn fail_gpu_migration() -> bool {
    #[cfg(feature = "selftest")]
    {
        FAIL_GPU_MIGRATION.load(Ordering::SeqCst)
    }
    #[cfg(not(feature = "selftest"))]
    {
        false
    }
}

#[inline]
pub(crate) fn fail_work_allocation() -> bool {
    #[cfg(feature = "selftest")]
    {
        FAIL_WORK_ALLOCATION.load(Ordering::SeqCst)
    }
    #[cfg(not(feature = "selftest"))]
    {
        false
    }
}
