//! Work-stealing task scheduler.
//!
//! One worker per logical processor: the constructing thread is worker 0,
//! and `N - 1` OS threads run workers `1..N`.  Every worker owns a local
//! Chase–Lev deque and a local task pool; external submitters publish into
//! a bounded global inbox backed by a global task pool.  Workers sleep on a
//! condition variable only while no inbox work exists; a worker whose task
//! still has open children spins cooperatively through other tasks instead
//! of blocking.
//!
//! All internal structures — deque buffers, task pool slabs — are allocated
//! through the [`Allocator`] facade handed in at construction.

use super::deque::{GlobalWorkQueue, WorkStealQueue, GLOBAL_QUEUE_SIZE, WORK_QUEUE_SIZE};
use super::{Kernel, Task, TaskData, TaskId};
use crate::memory::allocator::Allocator;
use crate::memory::pool::PoolAllocator;
use crate::memory::stats;
use crate::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use crate::sync::{thread, Condvar, Mutex};
use std::cell::Cell;
use std::ptr::NonNull;
// The scheduler's Arcs are lifetime plumbing shared with worker threads,
// not modelled synchronization; std's Arc also supports the dyn coercion.
use std::sync::Arc;

/// Scheduler configuration.  A zero worker count means "one per logical
/// processor".
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerConfig {
    pub num_workers: usize,
}

/// Task identifiers reserve 8 bits for the pool index, and index `N` is the
/// global pool, so at most 255 workers are addressable.
const MAX_WORKERS: usize = 255;

/// A worker's deque and task pool, kept together the way they are used.
struct WorkerSlot {
    queue: WorkStealQueue,
    pool: PoolAllocator,
}

struct Inner {
    num_threads: usize,
    done: AtomicBool,
    /// Guards only the inbox wait (and serialises inbox producers).
    lock: Mutex<()>,
    available: Condvar,
    global_queue: GlobalWorkQueue,
    global_pool: PoolAllocator,
    workers: Vec<WorkerSlot>,
}

thread_local! {
    /// `(scheduler key, worker index)` of the worker loop running on this
    /// thread, if any.  Routes in-worker submissions to the local deque.
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

pub struct Scheduler {
    inner: Arc<Inner>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler with one worker per logical processor.
    pub fn new(alloc: Arc<dyn Allocator>) -> Option<Self> {
        Self::with_config(alloc, SchedulerConfig::default())
    }

    /// Create a scheduler with an explicit worker count.  Returns `None`
    /// when the allocator cannot supply the queues and pools.
    pub fn with_config(alloc: Arc<dyn Allocator>, config: SchedulerConfig) -> Option<Self> {
        let detected = std::thread::available_parallelism().map_or(1, |n| n.get());
        let num_threads = match config.num_workers {
            0 => detected,
            n => n,
        }
        .min(MAX_WORKERS)
        .max(1);

        let global_queue = GlobalWorkQueue::new(Arc::clone(&alloc))?;
        let global_pool = PoolAllocator::new(
            Arc::clone(&alloc),
            std::mem::size_of::<Task>(),
            GLOBAL_QUEUE_SIZE,
            8,
            0,
        )?;

        let mut workers = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            workers.push(WorkerSlot {
                queue: WorkStealQueue::new(Arc::clone(&alloc), WORK_QUEUE_SIZE)?,
                pool: PoolAllocator::new(
                    Arc::clone(&alloc),
                    std::mem::size_of::<Task>(),
                    WORK_QUEUE_SIZE,
                    8,
                    0,
                )?,
            });
        }

        let inner = Arc::new(Inner {
            num_threads,
            done: AtomicBool::new(false),
            lock: Mutex::new(()),
            available: Condvar::new(),
            global_queue,
            global_pool,
            workers,
        });

        // Worker 0 is the calling thread; spawn the rest.
        let handles = (1..num_threads)
            .map(|index| {
                let inner = Arc::clone(&inner);
                thread::spawn_named(format!("strata-worker-{index}"), move || {
                    worker_thread(&inner, index);
                })
            })
            .collect();

        log::debug!("scheduler: started with {num_threads} workers");
        Some(Self { inner, handles })
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.inner.num_threads
    }

    /// Worker index of the current thread for this scheduler, if it is one
    /// of our workers.
    fn current_worker(&self) -> Option<usize> {
        let key = Arc::as_ptr(&self.inner) as usize;
        CURRENT_WORKER.with(|c| {
            c.get()
                .filter(|(owner, _)| *owner == key)
                .map(|(_, index)| index)
        })
    }

    /// Acquire a task slot and initialise its record.
    ///
    /// `open_tasks` must be 1 plus the number of children that will be
    /// attached to this task; attaching a child later never bumps the
    /// counter beyond what is reserved here.  Called from a worker thread
    /// the slot comes from that worker's pool, otherwise from the global
    /// pool.  Returns `None` when the pool is exhausted (retry once slots
    /// drain).
    pub fn create_task(
        &self,
        kernel: Kernel,
        task_data: TaskData,
        parent: Option<TaskId>,
        open_tasks: u32,
    ) -> Option<TaskId> {
        debug_assert!(open_tasks >= 1, "a task is at least its own execution");
        let inner = &self.inner;

        let (pool_index, pool) = match self.current_worker() {
            Some(index) => (index, &inner.workers[index].pool),
            None => (inner.num_threads, &inner.global_pool),
        };

        let slot = pool.allocate(std::mem::size_of::<Task>(), 8, 0, None)?;
        let id = TaskId::pack(pool_index, pool.slot_index(slot));
        let parent_ptr = parent.map_or(std::ptr::null_mut(), |pid| inner.task_ptr(pid));

        // Safety: the slot is an exclusive, properly sized and aligned Task
        // record.
        unsafe {
            slot.cast::<Task>().as_ptr().write(Task {
                parent: parent_ptr,
                open_tasks: AtomicU32::new(open_tasks),
                task_id: id,
                kernel,
                task_data,
            });
        }
        Some(id)
    }

    /// Publish a created task.  From inside a worker the task goes to that
    /// worker's deque; from any other thread to the global inbox.  Returns
    /// false on bounded-queue overflow — the record stays live and the
    /// caller may retry.
    pub fn submit(&self, id: TaskId) -> bool {
        let inner = &self.inner;
        let task = inner.task_ptr(id);

        if let Some(index) = self.current_worker() {
            return inner.workers[index].queue.push(task);
        }

        // The submit lock makes this thread the inbox's single producer and
        // pairs the publish with the wakeup.
        let guard = inner.lock.lock().unwrap();
        let pushed = inner.global_queue.push(task);
        if pushed {
            inner.available.notify_one();
        }
        drop(guard);
        pushed
    }

    /// Whether the task's counter has reached zero.
    ///
    /// The slot may be recycled at any point after this returns true;
    /// callers that poll must keep the task alive, typically by reserving
    /// an extra count at creation and releasing it with
    /// [`finish_task`](Self::finish_task) once done querying.
    #[must_use]
    pub fn is_task_finished(&self, id: TaskId) -> bool {
        let task = self.inner.task_ptr(id);
        // Safety: the caller keeps the record alive while querying.
        unsafe { (*task).open_tasks.load(Ordering::Acquire) == 0 }
    }

    /// Drop one reference to the task, as if one of its children finished.
    /// The last release returns the slot to its pool.
    pub fn finish_task(&self, id: TaskId) {
        let task = self.inner.task_ptr(id);
        // Safety: the caller holds an outstanding count on this record.
        unsafe { finish_task(&self.inner, task) };
    }

    /// Run at most one pending task on the calling thread (local deque,
    /// then inbox, then stealing), yielding when idle.  Lets a submitting
    /// thread participate as worker 0 while it waits.
    ///
    /// Only one thread may drive worker 0 — the Chase–Lev owner side is
    /// single-threaded — so call this from the thread that constructed the
    /// scheduler.
    pub fn help_run(&self) {
        let key = Arc::as_ptr(&self.inner) as usize;
        let prev = CURRENT_WORKER.with(|c| c.replace(Some((key, 0))));
        run_other_tasks(&self.inner, 0);
        CURRENT_WORKER.with(|c| c.set(prev));
    }

    /// Task records currently live across the global and per-worker pools.
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        let inner = &self.inner;
        inner.global_pool.live()
            + inner
                .workers
                .iter()
                .map(|worker| worker.pool.live())
                .sum::<usize>()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.done.store(true, Ordering::Release);
        {
            let _guard = self.inner.lock.lock().unwrap();
            self.inner.available.notify_all();
        }
        for handle in self.handles.drain(..) {
            drop(handle.join());
        }
        debug_assert!(
            self.inner.global_queue.is_empty(),
            "scheduler dropped with queued tasks"
        );
    }
}

impl Inner {
    /// Resolve a task id to its record: pool base plus slot offset.
    fn task_ptr(&self, id: TaskId) -> *mut Task {
        let pool_index = id.pool_index();
        let pool = if pool_index == self.num_threads {
            &self.global_pool
        } else {
            &self.workers[pool_index].pool
        };
        // Safety: the id was packed from a slot of this pool.
        unsafe { pool.slot_at(id.offset()).cast::<Task>() }
    }
}

/// Body of workers `1..N`.
fn worker_thread(inner: &Arc<Inner>, index: usize) {
    let key = Arc::as_ptr(inner) as usize;
    CURRENT_WORKER.with(|c| c.set(Some((key, index))));

    while !inner.done.load(Ordering::Acquire) {
        if let Some(task) = wait_until_task_is_available(inner) {
            run_task(inner, task.as_ptr(), index);
        }
    }

    CURRENT_WORKER.with(|c| c.set(None));
}

/// Block on the condition variable until the inbox has work or the
/// scheduler shuts down.
fn wait_until_task_is_available(inner: &Inner) -> Option<NonNull<Task>> {
    let mut guard = inner.lock.lock().unwrap();
    loop {
        if inner.done.load(Ordering::Acquire) {
            return None;
        }
        if let Some(task) = inner.global_queue.pop() {
            return Some(task);
        }
        guard = inner.available.wait(guard).unwrap();
    }
}

/// Execute one task: wait out its open children by running other work, then
/// invoke the kernel and settle the counters.
fn run_task(inner: &Inner, task: *mut Task, index: usize) {
    // Safety: a task handed to run_task is live and exclusively ours to
    // execute; only the counter is shared with other threads.
    unsafe {
        while (*task).open_tasks.load(Ordering::Acquire) > 1 {
            run_other_tasks(inner, index);
        }
        let kernel = (*task).kernel;
        kernel(&mut (*task).task_data);
        stats::TASKS_EXECUTED.add(1);
        finish_task(inner, task);
    }
}

/// Cooperative progress while a task waits: own deque first, then the
/// inbox, then round-robin stealing; yield to the OS when empty-handed.
fn run_other_tasks(inner: &Inner, index: usize) {
    let task = inner.workers[index]
        .queue
        .pop()
        .or_else(|| inner.global_queue.pop())
        .or_else(|| steal_from_other_workers(inner, index));

    match task {
        Some(task) => run_task(inner, task.as_ptr(), index),
        None => thread::yield_now(),
    }
}

fn steal_from_other_workers(inner: &Inner, index: usize) -> Option<NonNull<Task>> {
    let n = inner.num_threads;
    for i in 0..n {
        let victim = (index + i + 1) % n;
        if let Some(task) = inner.workers[victim].queue.steal() {
            return Some(task);
        }
    }
    None
}

/// Settle one completed reference on a task.  When the counter hits zero
/// the parent is notified (one decrement per completed child) and the slot
/// goes back to the pool named by the task id.
///
/// # Safety
/// `task` must be a live record with an outstanding count held by the
/// caller.
unsafe fn finish_task(inner: &Inner, task: *mut Task) {
    // Safety: contract above.
    unsafe {
        let before = (*task).open_tasks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before != 0, "open_tasks underflow");
        if before != 1 {
            return;
        }

        let parent = (*task).parent;
        let id = (*task).task_id;
        if !parent.is_null() {
            finish_task(inner, parent);
        }

        let pool_index = id.pool_index();
        let pool = if pool_index == inner.num_threads {
            &inner.global_pool
        } else {
            &inner.workers[pool_index].pool
        };
        // Safety: the record is dead; its slot returns to the originating
        // pool.
        pool.deallocate(NonNull::new_unchecked(task.cast::<u8>()));
    }
}
