use super::Vma;
use crate::error::{VmaError, VmaResult};
use crate::fence::{Fence, OperationCtx};
use crate::object::Domains;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct ActiveInner {
    /// The last bind, while it is in flight.
    exclusive: Option<Fence>,
    users: Vec<Fence>,
}

/// Tracks the GPU work still using a VMA.
#[derive(Debug, Default)]
pub struct ActiveTracker {
    inner: Mutex<ActiveInner>,
}

impl ActiveTracker {
    /// The in-flight bind, if any.
    #[must_use]
    pub fn exclusive(&self) -> Option<Fence> {
        let mut inner = self.inner.lock();
        inner.exclusive.take_if(|f| f.is_signaled());
        inner.exclusive.clone()
    }

    pub(crate) fn set_exclusive(&self, fence: Fence) {
        self.inner.lock().exclusive = Some(fence);
    }

    /// Records a user of the VMA.
    pub fn add(&self, fence: &Fence) {
        let mut inner = self.inner.lock();
        inner.users.retain(|f| !f.is_signaled());
        if !inner.users.iter().any(|f| Fence::ptr_eq(f, fence)) {
            inner.users.push(fence.clone());
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.fences().is_empty()
    }

    /// Pending fences, the bind first.
    #[must_use]
    pub fn fences(&self) -> Vec<Fence> {
        let mut inner = self.inner.lock();
        inner.exclusive.take_if(|f| f.is_signaled());
        inner.users.retain(|f| !f.is_signaled());
        inner
            .exclusive
            .iter()
            .chain(inner.users.iter())
            .cloned()
            .collect()
    }

    /// Waits until the VMA is idle. Failed work still counts as retired;
    /// only an interrupted wait is reported.
    ///
    /// # Errors
    /// `Interrupted` or `WaitTimeout` from `ctx`.
    pub fn sync(&self, ctx: &OperationCtx) -> VmaResult<()> {
        for fence in self.fences() {
            match fence.wait_ctx(ctx) {
                Err(e @ (VmaError::Interrupted | VmaError::WaitTimeout)) => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }
}

impl Vma {
    /// Records GPU work using the VMA and publishes it on the object's
    /// reservation; a write also moves the object to the GTT write domain.
    pub fn move_to_active(&self, fence: &Fence, write: bool) {
        self.active.add(fence);
        if write {
            self.obj.resv().add_exclusive(fence);
            self.obj.set_write_domain(Domains::GTT);
        } else {
            self.obj.resv().add_shared(fence);
        }
    }

    /// Waits for an asynchronous bind to land.
    ///
    /// # Errors
    /// The bind's error, or an interrupted wait.
    pub fn wait_for_bind(&self, ctx: &OperationCtx) -> VmaResult<()> {
        match self.active.exclusive() {
            Some(fence) => fence.wait_ctx(ctx),
            None => Ok(()),
        }
    }

    /// Waits until no GPU work uses the VMA.
    ///
    /// # Errors
    /// `Interrupted` or `WaitTimeout` from `ctx`.
    pub fn sync(&self, ctx: &OperationCtx) -> VmaResult<()> {
        self.active.sync(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signalled_fences_retire() {
        let tracker = ActiveTracker::default();
        let bind = Fence::new("bind");
        let user = Fence::new("user");
        tracker.set_exclusive(bind.clone());
        tracker.add(&user);
        tracker.add(&user);
        assert_eq!(tracker.fences().len(), 2);

        bind.signal(Err(VmaError::HardwareFault(3)));
        assert!(tracker.exclusive().is_none());
        assert!(!tracker.is_idle());

        user.signal(Ok(()));
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_sync_ignores_failed_work() {
        let tracker = ActiveTracker::default();
        tracker.add(&Fence::failed("user", VmaError::HardwareFault(1)));
        assert_eq!(tracker.sync(&OperationCtx::new()), Ok(()));
    }
}
