//! Worker dispatch for the parallel maintenance phases.
//!
//! The engine does not need a load-balancing parallel-for; every parallel
//! phase load balances itself by claiming work items off a shared atomic
//! counter. All a dispatcher has to do is start `thread_count` workers and
//! join them, so wrapping an existing application thread pool is easy.

use crate::memory::buffer_pool::BufferPool;
use crate::memory::worker_buffer_pools::WorkerBufferPools;
use crossbeam_utils::Backoff;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Function invoked on each worker. Receives the worker index and the
/// dispatcher that launched it.
pub type WorkerBodyFn = fn(worker_index: i32, dispatcher: &dyn ThreadDispatcher);

/// Provides dispatch, a worker count, and per-worker memory pools.
///
/// `dispatch_workers` must not return until every launched worker body has
/// completed; the maintenance pass relies on that join as the happens-before
/// barrier between its phases.
pub trait ThreadDispatcher: Send + Sync {
    /// Number of workers this dispatcher launches.
    fn thread_count(&self) -> i32;

    /// Context pointer associated with the dispatch currently in flight.
    fn unmanaged_context(&self) -> *mut ();

    /// Launches `worker_body` on workers `0..thread_count`, passing
    /// `unmanaged_context` through [`ThreadDispatcher::unmanaged_context`].
    /// Workers with index at or beyond `maximum_worker_count` are not
    /// launched. Returns once all launched workers have completed.
    ///
    /// # Safety
    /// `unmanaged_context` must remain valid for the duration of the
    /// dispatch, and whatever it points to must tolerate the sharing the
    /// worker body performs.
    unsafe fn dispatch_workers(
        &self,
        worker_body: WorkerBodyFn,
        maximum_worker_count: i32,
        unmanaged_context: *mut (),
    );

    /// Per-worker memory pools. Everything a worker takes from its pool
    /// during a dispatch is returned before the pass completes.
    fn worker_pools(&self) -> &WorkerBufferPools;

    /// Raw pointer to one worker's pool. The caller must be (or act on
    /// behalf of) that worker.
    fn worker_pool_ptr(&self, worker_index: i32) -> *mut BufferPool {
        self.worker_pools().get_pool_ptr(worker_index)
    }
}

/// Deterministic dispatcher: runs worker bodies sequentially, in index
/// order, on the calling thread.
///
/// Reruns of a pass through this dispatcher are bit-reproducible, which the
/// engine's determinism guarantees are stated against. Also the dispatcher
/// of choice for single-threaded hosts.
pub struct PassthroughDispatcher {
    thread_count: i32,
    worker_pools: WorkerBufferPools,
    context: UnsafeCell<*mut ()>,
}

unsafe impl Send for PassthroughDispatcher {}
unsafe impl Sync for PassthroughDispatcher {}

impl PassthroughDispatcher {
    pub fn new(thread_count: i32) -> Self {
        assert!(thread_count > 0, "Worker count must be positive.");
        Self {
            thread_count,
            worker_pools: WorkerBufferPools::new_default(thread_count),
            context: UnsafeCell::new(std::ptr::null_mut()),
        }
    }

    /// Releases the blocks held by the worker pools.
    pub fn clear_worker_pools(&mut self) {
        self.worker_pools.clear();
    }
}

impl ThreadDispatcher for PassthroughDispatcher {
    fn thread_count(&self) -> i32 {
        self.thread_count
    }

    fn unmanaged_context(&self) -> *mut () {
        unsafe { *self.context.get() }
    }

    unsafe fn dispatch_workers(
        &self,
        worker_body: WorkerBodyFn,
        maximum_worker_count: i32,
        unmanaged_context: *mut (),
    ) {
        *self.context.get() = unmanaged_context;
        for worker_index in 0..self.thread_count.min(maximum_worker_count) {
            worker_body(worker_index, self);
        }
        *self.context.get() = std::ptr::null_mut();
    }

    fn worker_pools(&self) -> &WorkerBufferPools {
        &self.worker_pools
    }
}

#[derive(Clone, Copy)]
struct Job {
    body: WorkerBodyFn,
    context: *mut (),
    worker_cap: i32,
}

struct DispatcherCore {
    thread_count: i32,
    worker_pools: WorkerBufferPools,
    job: UnsafeCell<Option<Job>>,
    /// Bumped once per dispatch; workers treat a change as the start signal.
    epoch: AtomicU32,
    /// Workers that have not yet finished the current dispatch.
    remaining: AtomicI32,
    disposed: AtomicBool,
}

unsafe impl Send for DispatcherCore {}
unsafe impl Sync for DispatcherCore {}

impl ThreadDispatcher for DispatcherCore {
    fn thread_count(&self) -> i32 {
        self.thread_count
    }

    fn unmanaged_context(&self) -> *mut () {
        unsafe { (*self.job.get()).map_or(std::ptr::null_mut(), |job| job.context) }
    }

    unsafe fn dispatch_workers(
        &self,
        worker_body: WorkerBodyFn,
        maximum_worker_count: i32,
        unmanaged_context: *mut (),
    ) {
        *self.job.get() = Some(Job {
            body: worker_body,
            context: unmanaged_context,
            worker_cap: maximum_worker_count,
        });
        // remaining counts the spawned threads only; worker 0 is this thread.
        self.remaining.store(self.thread_count - 1, Ordering::Relaxed);
        self.epoch.fetch_add(1, Ordering::Release);

        if maximum_worker_count > 0 {
            worker_body(0, self);
        }

        let backoff = Backoff::new();
        while self.remaining.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
        *self.job.get() = None;
    }

    fn worker_pools(&self) -> &WorkerBufferPools {
        &self.worker_pools
    }
}

fn worker_loop(core: Arc<DispatcherCore>, worker_index: i32) {
    let mut last_epoch = 0u32;
    let backoff = Backoff::new();
    loop {
        let epoch = core.epoch.load(Ordering::Acquire);
        if epoch == last_epoch {
            if core.disposed.load(Ordering::Relaxed) {
                return;
            }
            backoff.snooze();
            continue;
        }
        backoff.reset();
        last_epoch = epoch;
        // The job was published before the epoch bump; the acquire above
        // makes it visible.
        let job = unsafe { (*core.job.get()).expect("Epoch advanced without a job.") };
        if worker_index < job.worker_cap {
            (job.body)(worker_index, &*core);
        }
        core.remaining.fetch_sub(1, Ordering::Release);
    }
}

/// Dispatcher backed by persistent spinning worker threads.
///
/// Worker 0 runs on the dispatching thread; workers `1..thread_count` live on
/// dedicated threads that sleep in an adaptive backoff between dispatches.
/// Dropping the dispatcher shuts the threads down.
pub struct SimpleThreadDispatcher {
    core: Arc<DispatcherCore>,
    threads: Vec<JoinHandle<()>>,
}

impl SimpleThreadDispatcher {
    pub fn new(thread_count: i32) -> Self {
        assert!(thread_count > 0, "Worker count must be positive.");
        let core = Arc::new(DispatcherCore {
            thread_count,
            worker_pools: WorkerBufferPools::new_default(thread_count),
            job: UnsafeCell::new(None),
            epoch: AtomicU32::new(0),
            remaining: AtomicI32::new(0),
            disposed: AtomicBool::new(false),
        });
        let threads = (1..thread_count)
            .map(|worker_index| {
                let core = Arc::clone(&core);
                std::thread::spawn(move || worker_loop(core, worker_index))
            })
            .collect();
        Self { core, threads }
    }
}

impl ThreadDispatcher for SimpleThreadDispatcher {
    fn thread_count(&self) -> i32 {
        self.core.thread_count
    }

    fn unmanaged_context(&self) -> *mut () {
        self.core.unmanaged_context()
    }

    unsafe fn dispatch_workers(
        &self,
        worker_body: WorkerBodyFn,
        maximum_worker_count: i32,
        unmanaged_context: *mut (),
    ) {
        self.core
            .dispatch_workers(worker_body, maximum_worker_count, unmanaged_context);
    }

    fn worker_pools(&self) -> &WorkerBufferPools {
        self.core.worker_pools()
    }
}

impl Drop for SimpleThreadDispatcher {
    fn drop(&mut self) {
        self.core.disposed.store(true, Ordering::Relaxed);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    struct CountContext {
        sum: AtomicI64,
        hits: AtomicI32,
    }

    fn counting_body(worker_index: i32, dispatcher: &dyn ThreadDispatcher) {
        let context = unsafe { &*(dispatcher.unmanaged_context() as *const CountContext) };
        context.sum.fetch_add(worker_index as i64, Ordering::Relaxed);
        context.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn passthrough_runs_all_workers() {
        let dispatcher = PassthroughDispatcher::new(4);
        let context = CountContext {
            sum: AtomicI64::new(0),
            hits: AtomicI32::new(0),
        };
        unsafe {
            dispatcher.dispatch_workers(counting_body, 4, &context as *const _ as *mut ());
        }
        assert_eq!(context.sum.load(Ordering::Relaxed), 0 + 1 + 2 + 3);
        assert_eq!(context.hits.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn passthrough_respects_worker_cap() {
        let dispatcher = PassthroughDispatcher::new(4);
        let context = CountContext {
            sum: AtomicI64::new(0),
            hits: AtomicI32::new(0),
        };
        unsafe {
            dispatcher.dispatch_workers(counting_body, 2, &context as *const _ as *mut ());
        }
        assert_eq!(context.hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn threaded_dispatch_joins_all_workers() {
        let dispatcher = SimpleThreadDispatcher::new(4);
        let context = CountContext {
            sum: AtomicI64::new(0),
            hits: AtomicI32::new(0),
        };
        for _ in 0..16 {
            context.hits.store(0, Ordering::Relaxed);
            unsafe {
                dispatcher.dispatch_workers(counting_body, 4, &context as *const _ as *mut ());
            }
            assert_eq!(context.hits.load(Ordering::Relaxed), 4);
        }
    }
}
