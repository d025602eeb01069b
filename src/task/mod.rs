//! Task records and identifiers for the work-stealing scheduler.

pub(crate) mod deque;
pub mod scheduler;

use crate::sync::atomic::AtomicU32;

/// Function executed when a task runs.
pub type Kernel = fn(&mut TaskData);

/// Stream bundle for data-parallel kernels: up to four input and four
/// output streams plus the element count they carry.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct StreamingData {
    pub element_count: u32,
    pub input_streams: [*mut u8; 4],
    pub output_streams: [*mut u8; 4],
}

impl Default for StreamingData {
    fn default() -> Self {
        Self {
            element_count: 0,
            input_streams: [std::ptr::null_mut(); 4],
            output_streams: [std::ptr::null_mut(); 4],
        }
    }
}

/// The kernel-visible payload of a task.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct TaskData {
    /// Arbitrary kernel argument.
    pub kernel_data: *mut u8,
    pub streaming: StreamingData,
}

impl TaskData {
    #[must_use]
    pub fn new(kernel_data: *mut u8) -> Self {
        Self {
            kernel_data,
            streaming: StreamingData::default(),
        }
    }
}

impl Default for TaskData {
    fn default() -> Self {
        Self::new(std::ptr::null_mut())
    }
}

/// Packed task identity: bits 0–15 hold the slot offset within its pool,
/// bits 16–23 the pool index (local pools `0..N`, the global pool at `N`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(usize);

impl TaskId {
    pub(crate) fn pack(pool_index: usize, offset: usize) -> Self {
        debug_assert!(offset <= 0xFFFF, "slot offset {offset} exceeds 16 bits");
        debug_assert!(pool_index <= 0xFF, "pool index {pool_index} exceeds 8 bits");
        Self((pool_index << 16) | offset)
    }

    /// Slot offset within the owning pool.
    #[must_use]
    pub fn offset(self) -> usize {
        self.0 & 0xFFFF
    }

    /// Index of the owning pool.
    #[must_use]
    pub fn pool_index(self) -> usize {
        (self.0 & 0xFF_0000) >> 16
    }
}

/// A schedulable task.  Records live in pool slots; `parent` is a weak back
/// reference (the parent always outlives its children).
///
/// `parent` is deliberately the first field: once the record dies, its pool
/// threads the free-list link through the slot's first word, and clobbering
/// a dead task's parent is harmless while `open_tasks` keeps reading zero.
#[repr(C)]
pub struct Task {
    pub(crate) parent: *mut Task,
    /// Live children plus one for the task's own execution.
    pub(crate) open_tasks: AtomicU32,
    pub(crate) task_id: TaskId,
    pub(crate) kernel: Kernel,
    pub task_data: TaskData,
}

impl Task {
    /// The task's packed identity.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.task_id
    }

    /// Recover the task record embedding a kernel's `TaskData` argument.
    ///
    /// # Safety
    /// `data` must be the `task_data` field of a live `Task` (which is what
    /// every kernel receives).
    #[must_use]
    pub unsafe fn containing(data: *mut TaskData) -> *mut Task {
        // Safety: data sits at a fixed offset inside its Task.
        unsafe {
            data.cast::<u8>()
                .sub(std::mem::offset_of!(Task, task_data))
                .cast::<Task>()
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_packing() {
        let id = TaskId::pack(3, 77);
        assert_eq!(id.pool_index(), 3);
        assert_eq!(id.offset(), 77);

        let id = TaskId::pack(0xFF, 0xFFFF);
        assert_eq!(id.pool_index(), 0xFF);
        assert_eq!(id.offset(), 0xFFFF);

        let id = TaskId::pack(0, 0);
        assert_eq!(id.pool_index(), 0);
        assert_eq!(id.offset(), 0);
    }

    #[test]
    fn test_parent_is_first_field() {
        // The pool free-list link reuses the first word of a dead slot; it
        // must land on `parent`, never on `open_tasks`.
        assert_eq!(std::mem::offset_of!(Task, parent), 0);
        assert!(std::mem::offset_of!(Task, open_tasks) >= 8);
    }

    #[test]
    fn test_containing_round_trip() {
        fn noop(_: &mut TaskData) {}
        let mut task = Task {
            parent: std::ptr::null_mut(),
            open_tasks: AtomicU32::new(1),
            task_id: TaskId::pack(1, 2),
            kernel: noop,
            task_data: TaskData::default(),
        };
        let data = std::ptr::addr_of_mut!(task.task_data);
        // Safety: data is the task_data of a live Task.
        let recovered = unsafe { Task::containing(data) };
        assert_eq!(recovered, std::ptr::addr_of_mut!(task));
    }
}
