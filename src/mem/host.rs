use crate::error::{VmaError, VmaResult};
use std::ptr::NonNull;

/// Anonymous, zero-filled CPU memory backing system pages or a local-memory
/// aperture. Unmapped on drop.
#[derive(Debug)]
pub struct HostMemory {
    ptr: NonNull<u8>,
    size: usize,
}

// The mapping is plain memory owned by this struct; concurrent access is
// coordinated by fences, as it would be for device memory.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// Maps `size` bytes of private anonymous memory.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size, `MapFailed` if the kernel refuses.
    pub fn map(size: usize) -> VmaResult<Self> {
        if size == 0 {
            return Err(VmaError::InvalidArgument("zero sized mapping".into()));
        }

        let ret = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ret == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            log::warn!("host mapping of {size} bytes failed (errno {errno})");
            return Err(VmaError::MapFailed(errno));
        }

        let ptr = NonNull::new(ret.cast::<u8>()).ok_or(VmaError::MapFailed(0))?;
        Ok(Self { ptr, size })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Address used as the bus address of system pages.
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    #[must_use]
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        let base = self.addr();
        addr >= base && addr.saturating_add(len) <= base + self.size as u64
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.size) };
        if ret != 0 {
            log::warn!(
                "munmap of {} bytes at {:p} failed",
                self.size,
                self.ptr.as_ptr()
            );
        }
    }
}
