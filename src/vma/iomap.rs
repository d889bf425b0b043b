#![allow(clippy::cast_possible_truncation)]

use super::{Vma, VmaFlags};
use crate::error::{VmaError, VmaResult};
use crate::fence::OperationCtx;
use crate::utils::GTT_PAGE_SIZE;
use std::sync::Arc;

/// CPU access through a globally bound VMA's page-table entries. Holds a pin
/// until dropped.
#[derive(Debug)]
pub struct IoMap {
    vma: Arc<Vma>,
    start: u64,
}

impl Vma {
    /// Maps the VMA for CPU access through the aperture.
    ///
    /// # Errors
    /// `InvalidArgument` unless the VMA is globally bound inside the
    /// mappable aperture; the bind's error if it failed.
    pub fn pin_iomap(self: &Arc<Self>, ctx: &OperationCtx) -> VmaResult<IoMap> {
        if !self.is_ggtt() {
            return Err(VmaError::InvalidArgument("iomap outside the global address space".into()));
        }
        self.wait_for_bind(ctx)?;
        if !self.is_bound(VmaFlags::GLOBAL_BIND) || !self.is_map_and_fenceable() {
            return Err(VmaError::InvalidArgument("vma is not mappable".into()));
        }

        self.pin_raw()?;
        match self.node() {
            Some(node) => Ok(IoMap {
                vma: self.clone(),
                start: node.start,
            }),
            None => {
                self.unpin();
                Err(VmaError::InvalidArgument("vma was unbound".into()))
            }
        }
    }
}

impl IoMap {
    #[must_use]
    pub fn vma(&self) -> &Arc<Vma> {
        &self.vma
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.vma.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Errors
    /// `InvalidArgument` outside the mapping or over a scratch page.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> VmaResult<()> {
        self.access(offset, buf.len() as u64, |ptr, at, len| unsafe {
            std::ptr::copy_nonoverlapping(ptr, buf[at..at + len].as_mut_ptr(), len);
        })
    }

    /// # Errors
    /// `InvalidArgument` outside the mapping or over a scratch page.
    pub fn write(&self, offset: u64, data: &[u8]) -> VmaResult<()> {
        self.access(offset, data.len() as u64, |ptr, at, len| unsafe {
            std::ptr::copy_nonoverlapping(data[at..at + len].as_ptr(), ptr, len);
        })?;
        self.vma.set_flags(VmaFlags::GGTT_WRITE);
        Ok(())
    }

    fn access(
        &self,
        offset: u64,
        len: u64,
        mut f: impl FnMut(*mut u8, usize, usize),
    ) -> VmaResult<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(VmaError::InvalidArgument(format!(
                "iomap access 0x{offset:x}+0x{len:x} outside mapping"
            )));
        }

        let vm = self.vma.vm();
        let regions = vm.gt().regions();
        let mut done = 0u64;
        while done < len {
            let addr = self.start + offset + done;
            let chunk = (GTT_PAGE_SIZE - addr % GTT_PAGE_SIZE).min(len - done);
            let ptr = vm
                .translate(addr)
                .and_then(|dma| regions.dma_to_host(dma, chunk))
                .ok_or_else(|| {
                    VmaError::InvalidArgument(format!("no page behind gtt address 0x{addr:x}"))
                })?;
            f(ptr, done as usize, chunk as usize);
            done += chunk;
        }
        Ok(())
    }
}

impl Drop for IoMap {
    fn drop(&mut self) {
        self.vma.unpin();
    }
}
