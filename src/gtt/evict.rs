use super::{AddressSpace, VmGuard};
use crate::error::{VmaError, VmaResult};
use crate::fence::OperationCtx;
use crate::vma::Vma;
use std::sync::Arc;

/// Frees address space by unbinding VMAs, called with the address-space lock
/// held when an insertion finds no room.
///
/// With `exclude_locked`, VMAs whose object lock is held elsewhere are left
/// alone.
pub trait Evictor: Send + Sync {
    /// Evicts VMAs overlapping `[start, end)`. Returns how many were unbound.
    ///
    /// # Errors
    /// Propagates unbind failures other than `Busy`.
    fn evict_range(
        &self,
        vm: &AddressSpace,
        guard: &mut VmGuard<'_>,
        start: u64,
        end: u64,
        exclude_locked: bool,
    ) -> VmaResult<usize>;

    /// Evicts everything evictable. Returns how many were unbound.
    ///
    /// # Errors
    /// Propagates unbind failures other than `Busy`.
    fn evict_all(
        &self,
        vm: &AddressSpace,
        guard: &mut VmGuard<'_>,
        exclude_locked: bool,
    ) -> VmaResult<usize>;
}

/// Unbinds unpinned, idle VMAs, least recently bound first.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleEvictor;

impl IdleEvictor {
    fn is_victim(vma: &Vma, range: Option<(u64, u64)>) -> bool {
        if vma.is_pinned() || vma.is_active() {
            return false;
        }
        match (range, vma.node()) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some((start, end)), Some(node)) => node.overlaps(start, end),
        }
    }

    fn evict(
        vm: &AddressSpace,
        guard: &mut VmGuard<'_>,
        range: Option<(u64, u64)>,
        exclude_locked: bool,
    ) -> VmaResult<usize> {
        let victims: Vec<Arc<Vma>> = guard.bound_snapshot();
        let ctx = OperationCtx::new();
        let mut evicted = 0;
        let mut result = Ok(());

        for vma in victims.iter().filter(|v| Self::is_victim(v, range)) {
            let obj_guard = if exclude_locked {
                match vma.obj().try_lock() {
                    Some(g) => Some(g),
                    None => continue,
                }
            } else {
                None
            };

            match vma.unbind_locked(guard, &ctx) {
                Ok(()) => evicted += 1,
                Err(VmaError::Busy) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
            drop(obj_guard);
        }

        guard.defer_drop_all(victims);
        log::debug!(
            "vm {}: evicted {evicted} vma(s) from {range:x?}",
            vm.id().raw()
        );
        result.map(|()| evicted)
    }
}

impl Evictor for IdleEvictor {
    fn evict_range(
        &self,
        vm: &AddressSpace,
        guard: &mut VmGuard<'_>,
        start: u64,
        end: u64,
        exclude_locked: bool,
    ) -> VmaResult<usize> {
        Self::evict(vm, guard, Some((start, end)), exclude_locked)
    }

    fn evict_all(
        &self,
        vm: &AddressSpace,
        guard: &mut VmGuard<'_>,
        exclude_locked: bool,
    ) -> VmaResult<usize> {
        Self::evict(vm, guard, None, exclude_locked)
    }
}
