//! GPU virtual memory areas and buffer migration.
//!
//! Buffer objects are mapped into GPU address spaces through [`Vma`]s, which
//! are pinned and bound on demand, and moved between memory regions by the
//! [`MigrationEngine`]. Asynchronous work is tracked with [`Fence`]s.

pub mod config;
pub mod context;
pub mod error;
pub mod fence;
pub mod gtt;
pub mod mem;
pub mod migrate;
pub mod object;
pub mod utils;
pub mod vma;
pub mod worker;

pub use config::{DeviceConfig, VmDesc};
pub use context::{Device, Gt, acquire, release};
pub use error::{VmaError, VmaResult};
pub use fence::{DepKind, DependencySet, Fence, OperationCtx, ReservationObject};
pub use gtt::AddressSpace;
pub use mem::{CacheLevel, MemoryRegion};
pub use migrate::{Blitter, CopyEngine, MigrateStats, MigrationEngine};
pub use object::{BufferObject, Madvise, ObjectFlags};
pub use vma::{PinFlags, PinRequest, View, Vma, VmaFlags, instance};
