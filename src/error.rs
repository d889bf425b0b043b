use thiserror::Error;

/// Errors produced by address-space, binding and migration operations.
///
/// Fences store and replay an error to every observer, so this type is `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmaError {
    #[error("No space left in address space")]
    NoSpace,

    #[error("Range at 0x{offset:x} conflicts with an existing node")]
    Conflict { offset: u64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource busy")]
    Busy,

    #[error("Object was closed or removed")]
    Closed,

    #[error("Pin count would overflow")]
    Overflow,

    #[error("VMA is in the error state")]
    ErrorState,

    #[error("GPU is wedged")]
    DeviceWedged,

    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    #[error("Hardware fault reported by fence (code {0})")]
    HardwareFault(i32),

    #[error("Wait interrupted")]
    Interrupted,

    #[error("Operation timed out")]
    WaitTimeout,

    #[error("mmap failed (errno {0})")]
    MapFailed(i32),
}

// A convenient alias
pub type VmaResult<T> = Result<T, VmaError>;
