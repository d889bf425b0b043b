//! Deferred destruction of closed VMAs.
//!
//! Closing a VMA only marks it; the binding is torn down the next time the
//! device parks, so that a quick reopen finds it still in place.

use super::Vma;
use super::registry::VmaList;
use crate::error::VmaResult;
use crate::fence::OperationCtx;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Debug, Default)]
pub struct ClosedVmas {
    list: Mutex<Vec<Arc<Vma>>>,
}

impl ClosedVmas {
    pub(crate) fn push(&self, vma: Arc<Vma>) {
        self.list.lock().push(vma);
    }

    pub(crate) fn remove(&self, vma: &Vma) -> Option<Arc<Vma>> {
        let mut list = self.list.lock();
        let pos = list.iter().position(|v| std::ptr::eq(Arc::as_ptr(v), vma))?;
        Some(list.swap_remove(pos))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroys closed VMAs. Those whose object is locked elsewhere, or that
    /// are still pinned, stay queued; reopened ones are dropped from the
    /// queue. Returns how many were destroyed.
    pub fn park(&self) -> usize {
        let closed = std::mem::take(&mut *self.list.lock());
        let mut requeue = Vec::new();
        let mut destroyed = 0;

        for vma in closed {
            if !vma.is_closed() {
                continue;
            }
            let Some(obj_guard) = vma.obj().try_lock() else {
                requeue.push(vma);
                continue;
            };
            let result = vma.destroy();
            drop(obj_guard);
            match result {
                Ok(true) => destroyed += 1,
                Ok(false) => {
                    if vma.is_closed() {
                        requeue.push(vma);
                    }
                }
                Err(err) => {
                    log::debug!("closed vma of object {} kept: {err}", vma.obj().id());
                    requeue.push(vma);
                }
            }
        }

        if !requeue.is_empty() {
            self.list.lock().extend(requeue);
        }
        destroyed
    }

    /// Drops every queued reference without unbinding.
    pub(crate) fn clear(&self) {
        let closed = std::mem::take(&mut *self.list.lock());
        drop(closed);
    }
}

impl Vma {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Takes another open reference.
    pub fn open(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops an open reference. The last one queues the VMA for
    /// destruction at the next park. Global VMAs are never closed.
    pub fn close(self: &Arc<Self>) {
        if self.is_ggtt() {
            return;
        }
        let prev = self.open_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "vma closed too often");
        if prev != 1 {
            return;
        }
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.gt().closed_vmas().push(self.clone());
        }
    }

    /// Takes a closed VMA off the destruction queue. Returns whether it was
    /// closed. A VMA already detached for destruction stays closed.
    pub fn reopen(&self) -> bool {
        let list = self.obj.vmas.read();
        let (reopened, queued) = self.reopen_locked(&list);
        drop(list);
        drop(queued);
        reopened
    }

    /// Reopens the VMA if it is closed and still registered in `list`, the
    /// object's locked VMA list. Also returns the destruction queue's
    /// reference, to be dropped once `list` is unlocked.
    pub(super) fn reopen_locked(&self, list: &VmaList) -> (bool, Option<Arc<Vma>>) {
        if !list.contains(self) || !self.closed.swap(false, Ordering::AcqRel) {
            return (false, None);
        }
        self.open_count.fetch_add(1, Ordering::AcqRel);
        (true, self.gt().closed_vmas().remove(self))
    }

    /// Detaches a closed, unpinned VMA from its object and unbinds it.
    /// Returns `Ok(false)` if it was reopened or is still pinned.
    ///
    /// The claim is made under the vm lock, which every pin takes, and the
    /// object's VMA list lock, which every reopen takes.
    fn destroy(&self) -> VmaResult<bool> {
        let mut guard = self.vm.lock();
        {
            let mut list = self.obj.vmas.write();
            if !self.is_closed() || self.is_pinned() {
                return Ok(false);
            }
            list.remove(self);
        }
        // Closed again after park took the queue.
        let queued = self.gt().closed_vmas().remove(self);
        self.unbind_locked(&mut guard, &OperationCtx::new())?;
        drop(guard);
        drop(queued);
        Ok(true)
    }
}
