use super::{Fence, OperationCtx};
use crate::error::VmaResult;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct ResvFences {
    exclusive: Option<Fence>,
    shared: Vec<Fence>,
}

impl ResvFences {
    fn prune(&mut self) {
        self.shared.retain(|f| !f.is_signaled());
        if self.exclusive.as_ref().is_some_and(Fence::is_signaled) {
            self.exclusive = None;
        }
    }
}

/// The set of pending read/write fences of one buffer.
///
/// This is the single synchronisation point shared by every VMA and every
/// migration touching the buffer: whoever starts GPU-visible work on it must
/// publish the work's fence here.
#[derive(Debug, Default)]
pub struct ReservationObject {
    fences: Mutex<ResvFences>,
}

impl ReservationObject {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a writer. It supersedes every previous fence, all of which it
    /// must already depend on.
    pub fn add_exclusive(&self, fence: &Fence) {
        let mut fences = self.fences.lock();
        fences.shared.clear();
        fences.exclusive = Some(fence.clone());
    }

    /// Publishes a reader.
    pub fn add_shared(&self, fence: &Fence) {
        let mut fences = self.fences.lock();
        fences.prune();
        if !fences.shared.iter().any(|f| Fence::ptr_eq(f, fence)) {
            fences.shared.push(fence.clone());
        }
    }

    /// Snapshot of the unsignalled fences: `(exclusive, shared)`.
    #[must_use]
    pub fn fences(&self) -> (Option<Fence>, Vec<Fence>) {
        let mut fences = self.fences.lock();
        fences.prune();
        (fences.exclusive.clone(), fences.shared.clone())
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        let (exclusive, shared) = self.fences();
        exclusive.is_none() && shared.is_empty()
    }

    /// Waits for the exclusive fence and, if `wait_all`, every shared fence.
    ///
    /// # Errors
    /// Returns the first fence error or `Interrupted`.
    pub fn wait(&self, wait_all: bool, ctx: &OperationCtx) -> VmaResult<()> {
        let (exclusive, shared) = self.fences();
        if let Some(fence) = exclusive {
            fence.wait_ctx(ctx)?;
        }
        if wait_all {
            for fence in shared {
                fence.wait_ctx(ctx)?;
            }
        }
        Ok(())
    }
}
