#[cfg(not(target_pointer_width = "64"))]
compile_error!("strata supports only 64-bit targets.");

pub(crate) mod sync;

// allocators, OS VM adapter, diagnostics
pub mod memory;

// work-stealing deques and the scheduler
pub mod task;

// allocator facade
pub use memory::allocator::{AllocSite, Allocator, DEFAULT_ALIGNMENT};

// allocators
pub use memory::general::{GeneralAllocator, SpaceConfig};
pub use memory::linear::LinearAllocator;
pub use memory::pool::PoolAllocator;

// errors
pub use memory::vm::VmError;

// scheduler
pub use task::scheduler::{Scheduler, SchedulerConfig};
pub use task::{Kernel, StreamingData, Task, TaskData, TaskId};
