use crate::vma::VmaFlags;

// Defaults for a small integrated part.
const DEFAULT_GGTT_SIZE: u64 = 1 << 32;
const DEFAULT_MAPPABLE_END: u64 = 256 << 20;
const DEFAULT_FENCE_REGISTERS: usize = 16;
const DEFAULT_WORKERS: usize = 2;

/// Device-wide configuration (Maps to the probe-time GT parameters)
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    pub ggtt_size: u64,
    /// End of the CPU-mappable aperture at the start of the GGTT.
    pub mappable_end: u64,
    pub has_llc: bool,
    /// Size of device-local memory; zero for an integrated part.
    pub lmem_size: u64,
    pub fence_registers: usize,
    pub workers: usize,
    /// Whether a copy engine is available for accelerated moves.
    pub accel: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ggtt_size: DEFAULT_GGTT_SIZE,
            mappable_end: DEFAULT_MAPPABLE_END,
            has_llc: true,
            lmem_size: 0,
            fence_registers: DEFAULT_FENCE_REGISTERS,
            workers: DEFAULT_WORKERS,
            accel: true,
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn ggtt_size(mut self, size: u64) -> Self {
        self.ggtt_size = size;
        self
    }

    #[must_use]
    pub const fn mappable_end(mut self, end: u64) -> Self {
        self.mappable_end = end;
        self
    }

    #[must_use]
    pub const fn llc(mut self, has_llc: bool) -> Self {
        self.has_llc = has_llc;
        self
    }

    #[must_use]
    pub const fn lmem(mut self, size: u64) -> Self {
        self.lmem_size = size;
        self
    }

    #[must_use]
    pub const fn fence_registers(mut self, count: usize) -> Self {
        self.fence_registers = count;
        self
    }

    #[must_use]
    pub const fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    #[must_use]
    pub const fn accel(mut self, enabled: bool) -> Self {
        self.accel = enabled;
        self
    }

    /// Descriptor of the global address space. Parts without LLC colour the
    /// GGTT so that snooped and uncached pages never share a prefetch line.
    #[must_use]
    pub const fn ggtt_desc(&self) -> VmDesc {
        VmDesc {
            total: self.ggtt_size,
            mappable_end: if self.mappable_end < self.ggtt_size {
                self.mappable_end
            } else {
                self.ggtt_size
            },
            coloring: !self.has_llc,
            bind_async: VmaFlags::empty(),
        }
    }
}

/// Parameters of one address space.
#[derive(Debug, Clone, Copy)]
pub struct VmDesc {
    pub total: u64,
    pub mappable_end: u64,
    pub coloring: bool,
    /// Bind kinds whose page-table updates run asynchronously.
    pub bind_async: VmaFlags,
}

impl VmDesc {
    #[must_use]
    pub const fn new(total: u64) -> Self {
        Self {
            total,
            mappable_end: total,
            coloring: false,
            bind_async: VmaFlags::empty(),
        }
    }

    #[must_use]
    pub const fn coloring(mut self, enabled: bool) -> Self {
        self.coloring = enabled;
        self
    }

    #[must_use]
    pub const fn mappable_end(mut self, end: u64) -> Self {
        self.mappable_end = end;
        self
    }

    #[must_use]
    pub const fn bind_async(mut self, flags: VmaFlags) -> Self {
        self.bind_async = flags;
        self
    }
}
