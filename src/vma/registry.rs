//! Per-object VMA registry: at most one VMA per (address space, view).

use super::{View, Vma};
use crate::error::VmaResult;
use crate::gtt::{AddressSpace, AddressSpaceId};
use crate::object::BufferObject;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmaKey {
    vm: AddressSpaceId,
    view: View,
}

impl VmaKey {
    #[must_use]
    pub const fn new(vm: AddressSpaceId, view: View) -> Self {
        Self { vm, view }
    }

    #[must_use]
    pub const fn vm(&self) -> AddressSpaceId {
        self.vm
    }

    #[must_use]
    pub const fn view(&self) -> &View {
        &self.view
    }
}

/// Weak index of an object's VMAs. Global VMAs are kept at the front of the
/// list.
#[derive(Debug, Default)]
pub struct VmaList {
    tree: BTreeMap<VmaKey, Weak<Vma>>,
    list: VecDeque<Weak<Vma>>,
}

impl VmaList {
    #[must_use]
    pub fn lookup(&self, key: &VmaKey) -> Option<Arc<Vma>> {
        self.tree.get(key).and_then(Weak::upgrade)
    }

    /// Live VMAs, global ones first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Vma>> {
        self.list.iter().filter_map(Weak::upgrade).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.list.iter().filter(|w| w.strong_count() > 0).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `vma` is the one registered under its key.
    #[must_use]
    pub fn contains(&self, vma: &Vma) -> bool {
        self.tree
            .get(&vma.key())
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), vma))
    }

    pub(crate) fn insert(&mut self, vma: &Arc<Vma>) {
        let weak = Arc::downgrade(vma);
        self.list.retain(|w| w.strong_count() > 0);
        if vma.vm().is_ggtt() {
            self.list.push_front(weak.clone());
        } else {
            self.list.push_back(weak.clone());
        }
        self.tree.insert(vma.key(), weak);
    }

    /// Forgets `vma`. A newer VMA registered under the same key stays.
    pub(crate) fn remove(&mut self, vma: &Vma) {
        if self.contains(vma) {
            self.tree.remove(&vma.key());
        }
        self.list
            .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), vma));
    }
}

/// Returns the VMA of `obj` in `vm` under `view` (normal if `None`),
/// creating it on first use and reopening it if it was closed.
///
/// # Errors
/// `InvalidArgument` for a view outside the object or a non-normal view
/// outside the global address space; `NoSpace` if the view is larger than
/// the address space.
pub fn instance(
    obj: &Arc<BufferObject>,
    vm: &Arc<AddressSpace>,
    view: Option<&View>,
) -> VmaResult<Arc<Vma>> {
    let view = view.copied().unwrap_or_default();
    let key = VmaKey::new(vm.id(), view);

    // Reopening under the list lock keeps park from detaching the VMA
    // between lookup and reopen.
    let list = obj.vmas.read();
    if let Some(vma) = list.lookup(&key) {
        let (_, queued) = vma.reopen_locked(&list);
        drop(list);
        drop(queued);
        return Ok(vma);
    }
    drop(list);

    let vma = Vma::create(obj, vm, view)?;
    let mut list = obj.vmas.write();
    if let Some(existing) = list.lookup(&key) {
        let (_, queued) = existing.reopen_locked(&list);
        drop(list);
        drop(queued);
        // Lost the race; `vma` was never published.
        drop(vma);
        return Ok(existing);
    }
    list.insert(&vma);
    drop(list);
    log::trace!(
        "object {}: new vma in vm {} for {view:?}",
        obj.id(),
        vm.id().raw()
    );
    Ok(vma)
}

impl BufferObject {
    /// Live VMAs of the object, global ones first.
    #[must_use]
    pub fn vmas(&self) -> Vec<Arc<Vma>> {
        self.vmas.read().snapshot()
    }

    #[must_use]
    pub fn ggtt_vmas(&self) -> Vec<Arc<Vma>> {
        let mut vmas = self.vmas();
        vmas.retain(|v| v.vm().is_ggtt());
        vmas
    }

    #[must_use]
    pub fn lookup_vma(&self, vm: &AddressSpace, view: Option<&View>) -> Option<Arc<Vma>> {
        let key = VmaKey::new(vm.id(), view.copied().unwrap_or_default());
        self.vmas.read().lookup(&key)
    }
}
