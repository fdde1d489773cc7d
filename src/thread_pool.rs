//! The work-stealing executor.
//!
//! Each worker thread owns a FIFO deque. Jobs submitted from outside the pool go
//! into a shared injector. Workers that run out of local work steal batches from
//! the injector and from each other, and go to sleep when there is nothing left
//! to steal.

use std::cell::Cell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{self, AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crossbeam_deque::{Injector, Steal, Stealer, Worker as WorkerQueue};
use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::CachePadded;

use crate::job::{HeapJob, JobRef};

static NEXT_THREADPOOL_ID: AtomicU32 = AtomicU32::new(0);

/// The sleepy bitfield is a `u32` and external submitters use the index
/// just past the last worker as their waker hint.
const MAX_WORKERS: u32 = 31;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ThreadPoolId(u32);

/// A reference to a thread pool.
///
/// Cloning the handle does not create new threads. Dropping every handle does not
/// stop the workers either: call `shut_down` for that.
#[derive(Clone)]
pub struct ThreadPool {
    pub(crate) shared: Arc<Shared>,
}

impl ThreadPool {
    pub fn builder() -> ThreadPoolBuilder {
        let num_threads = std::thread::available_parallelism()
            .map_or(4, |n| n.get() as u32)
            .min(MAX_WORKERS);

        ThreadPoolBuilder {
            num_threads,
            name_handler: Box::new(|idx| format!("Worker#{}", idx)),
            stack_size: None,
            start_handler: None,
            exit_handler: None,
        }
    }

    /// Returns the pool that owns the current thread, if the current thread is
    /// one of its workers.
    pub fn current() -> Option<ThreadPool> {
        WorkerThread::with_current(|worker| {
            worker.map(|worker| ThreadPool { shared: worker.shared.clone() })
        })
    }

    /// Returns the index of the current worker thread within its pool.
    pub fn current_worker_index() -> Option<u32> {
        WorkerThread::with_current(|worker| worker.map(|worker| worker.index))
    }

    pub fn id(&self) -> ThreadPoolId {
        self.shared.id
    }

    pub fn num_worker_threads(&self) -> u32 {
        self.shared.num_workers
    }

    /// Schedule a job on the thread pool.
    ///
    /// When called from one of this pool's workers the job is pushed onto the
    /// worker's own deque, otherwise it goes through the injector.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // SAFETY: the closure is 'static, so the job can't outlive anything it borrows.
        let job = unsafe { HeapJob::new(job).into_job_ref() };
        self.shared.schedule_job(job);
    }

    /// Ask all workers to stop once they have run out of work.
    ///
    /// Must not be waited on from one of the pool's own workers.
    pub fn shut_down(&self) -> ShutdownHandle {
        log::debug!("shutting down thread pool {:?}", self.shared.id);
        self.shared.shutdown.is_shutting_down.store(true, Ordering::SeqCst);
        self.shared.sleep.wake_all();

        ShutdownHandle {
            shared: self.shared.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn ptr_eq(&self, other: &ThreadPool) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.shared.id)
            .field("num_workers", &self.shared.num_workers)
            .finish()
    }
}

pub struct ThreadPoolBuilder {
    num_threads: u32,
    name_handler: Box<dyn Fn(u32) -> String>,
    stack_size: Option<usize>,
    start_handler: Option<Box<dyn WorkerHook>>,
    exit_handler: Option<Box<dyn WorkerHook>>,
}

impl ThreadPoolBuilder {
    pub fn with_worker_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads.max(1).min(MAX_WORKERS);

        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where
        F: Fn(u32) -> String + 'static,
    {
        self.name_handler = Box::new(handler);

        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);

        self
    }

    /// Called on each worker thread before it starts executing jobs.
    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.start_handler = Some(Box::new(handler));

        self
    }

    /// Called on each worker thread after it stopped executing jobs.
    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.exit_handler = Some(Box::new(handler));

        self
    }

    pub fn build(self) -> io::Result<ThreadPool> {
        let num_threads = self.num_threads as usize;

        let mut stealers = Vec::with_capacity(num_threads);
        let mut queues = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let queue = WorkerQueue::new_fifo();
            stealers.push(CachePadded::new(queue.stealer()));
            queues.push(queue);
        }

        let (sleep, parkers) = Sleep::new(num_threads);

        let shared = Arc::new(Shared {
            id: ThreadPoolId(NEXT_THREADPOOL_ID.fetch_add(1, Ordering::Relaxed)),
            num_workers: num_threads as u32,
            injector: Injector::new(),
            stealers,
            sleep,
            shutdown: Shutdown::new(num_threads as u32),
            hooks: ThreadPoolHooks {
                start: self.start_handler,
                exit: self.exit_handler,
            },
        });

        for (index, (queue, parker)) in queues.into_iter().zip(parkers).enumerate() {
            let worker = WorkerThread {
                index: index as u32,
                queue,
                shared: shared.clone(),
            };

            let mut builder = std::thread::Builder::new().name((self.name_handler)(index as u32));
            if let Some(stack_size) = self.stack_size {
                builder = builder.stack_size(stack_size);
            }

            if let Err(err) = builder.spawn(move || worker.run(parker)) {
                log::error!("failed to spawn worker {} of thread pool {:?}: {}", index, shared.id, err);
                // The workers that never started won't report their shutdown.
                shared.shutdown.forget_workers((num_threads - index) as u32);
                ThreadPool { shared }.shut_down().wait();

                return Err(err);
            }
        }

        log::debug!("thread pool {:?} started with {} workers", shared.id, num_threads);

        Ok(ThreadPool { shared })
    }
}

/// Data accessible by all workers and all pool handles from any thread.
pub(crate) struct Shared {
    id: ThreadPoolId,
    /// Number of dedicated worker threads.
    num_workers: u32,
    /// Jobs submitted from threads that aren't workers of this pool.
    injector: Injector<JobRef>,
    stealers: Vec<CachePadded<Stealer<JobRef>>>,
    sleep: Sleep,
    shutdown: Shutdown,
    hooks: ThreadPoolHooks,
}

impl Shared {
    fn schedule_job(&self, job: JobRef) {
        profiling::scope!("schedule_job");

        let waker = WorkerThread::with_current(|worker| match worker {
            Some(worker) if ptr::eq(&*worker.shared, self) => {
                worker.queue.push(job);
                worker.index
            }
            _ => {
                self.injector.push(job);
                self.num_workers
            }
        });

        // Pairs with the fence in `WorkerThread::run` after a worker marks itself sleepy:
        // either we see its sleepy bit, or it sees our job.
        atomic::fence(Ordering::SeqCst);
        self.sleep.wake(1, waker);
    }

    fn has_pending_jobs(&self) -> bool {
        !self.injector.is_empty() || self.stealers.iter().any(|stealer| !stealer.is_empty())
    }
}

thread_local! {
    static CURRENT_WORKER: Cell<*const WorkerThread> = const { Cell::new(ptr::null()) };
}

struct WorkerThread {
    index: u32,
    queue: WorkerQueue<JobRef>,
    shared: Arc<Shared>,
}

impl WorkerThread {
    fn with_current<R>(f: impl FnOnce(Option<&WorkerThread>) -> R) -> R {
        let worker = CURRENT_WORKER.with(Cell::get);
        // SAFETY: the pointer is only non-null while `run` executes on this thread,
        // and `run` borrows the worker for its whole duration.
        f(unsafe { worker.as_ref() })
    }

    fn run(self, parker: Parker) {
        profiling::register_thread!("Worker");

        CURRENT_WORKER.with(|current| current.set(&self));
        log::trace!("worker {} of thread pool {:?} started", self.index, self.shared.id);

        if let Some(handler) = &self.shared.hooks.start {
            handler.run(self.index);
        }

        'main: loop {
            // First see if we have work to do in our own queue.
            while let Some(job) = self.queue.pop() {
                self.execute_job(job);
            }

            // See if there is work we can steal from the injector or other workers.
            if let Some(job) = self.steal() {
                self.execute_job(job);

                // If we found anything to do via work-stealing, go back to checking the local
                // queue again.
                continue 'main;
            }

            // Only the worker can install work in its own queue, so if we get here the queue
            // should be empty.
            debug_assert!(self.queue.is_empty());

            if self.shared.shutdown.is_shutting_down() {
                break;
            }

            // Couldn't find work to do in our or another worker's queue, so
            // it's sleepy time.
            self.shared.sleep.mark_sleepy(self.index);
            atomic::fence(Ordering::SeqCst);

            // A job may have been pushed after our last steal attempt but before we
            // became visible as sleepy, in which case nobody is going to wake us up.
            if self.shared.has_pending_jobs() || self.shared.shutdown.is_shutting_down() {
                self.shared.sleep.mark_awake(self.index);
                continue 'main;
            }

            parker.park();
        }

        // Shutdown phase.

        if let Some(handler) = &self.shared.hooks.exit {
            handler.run(self.index);
        }

        log::trace!("worker {} of thread pool {:?} stopped", self.index, self.shared.id);
        CURRENT_WORKER.with(|current| current.set(ptr::null()));

        self.shared.shutdown.worker_has_shut_down();
    }

    fn execute_job(&self, job: JobRef) {
        // SAFETY: jobs are only ever popped once from the queues.
        let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe { job.execute() }));
        if result.is_err() {
            log::error!("a job panicked on worker {} of thread pool {:?}", self.index, self.shared.id);
        }
    }

    /// Attempt to steal multiple jobs, returning one of them.
    ///
    /// Tries the injector first, then uses the waker hint to start stealing from
    /// the last thread that woke us up.
    fn steal(&self) -> Option<JobRef> {
        loop {
            match self.shared.injector.steal_batch_and_pop(&self.queue) {
                Steal::Success(job) => return Some(job),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }

        let stealers = &self.shared.stealers[..];
        let len = stealers.len();
        let start = self.shared.sleep.get_waker_hint(self.index as usize);

        'stealers: for i in 0..len {
            let idx = (start + i) % len;
            if idx == self.index as usize {
                continue;
            }

            for _ in 0..50 {
                match stealers[idx].steal_batch_and_pop(&self.queue) {
                    Steal::Success(job) => {
                        // We'll try to steal from here again next time.
                        self.shared.sleep.set_waker_hint(self.index as usize, idx);
                        return Some(job);
                    }
                    Steal::Empty => {
                        continue 'stealers;
                    }
                    Steal::Retry => {}
                }
            }
        }

        None
    }
}

struct SleepState {
    unparker: Unparker,
    // The index of the worker this one will start searching at next time it tries to steal.
    // Can be used as hint of which worker last woke this one.
    // Since it only guides a heuristic, it doesn't need to be perfectly accurate.
    next_target: AtomicU32,
}

struct Sleep {
    /// Atomic bitfield. Setting the Nth bit to one means the Nth worker thread is sleepy.
    sleepy_workers: AtomicU32,
    sleep_states: Vec<CachePadded<SleepState>>,
}

impl Sleep {
    fn new(num_threads: usize) -> (Self, Vec<Parker>) {
        let mut parkers = Vec::with_capacity(num_threads);
        let mut sleep_states = Vec::with_capacity(num_threads);

        for i in 0..num_threads {
            let parker = Parker::new();
            sleep_states.push(CachePadded::new(SleepState {
                unparker: parker.unparker().clone(),
                next_target: AtomicU32::new(((i + 1) % num_threads) as u32),
            }));
            parkers.push(parker);
        }

        (
            Sleep {
                // Workers start awake and go to sleep on their own if there is nothing to do.
                sleepy_workers: AtomicU32::new(0),
                sleep_states,
            },
            parkers,
        )
    }

    /// Wake up to n worker threads (stop when they are all awake).
    ///
    /// This function is fairly expensive when it causes a thread to
    /// wake up.
    /// However it is fairly cheap if all workers are already awake.
    fn wake(&self, mut n: u32, waker: u32) {
        while n > 0 {
            let mut sleepy_bits = self.sleepy_workers.load(Ordering::SeqCst);

            if sleepy_bits == 0 {
                // Everyone is already awake.
                return;
            }

            profiling::scope!("wake workers");

            for i in 0..(self.sleep_states.len() as u32) {
                let bit = 1 << i;
                if sleepy_bits & bit == 0 {
                    continue;
                }

                let prev = self.sleepy_workers.fetch_and(!bit, Ordering::SeqCst);
                if prev & bit == 0 {
                    // Someone else woke the thread up before we got to it.
                    // A good time to refresh our view of the sleep thread bits.
                    sleepy_bits = self.sleepy_workers.load(Ordering::SeqCst);

                    if sleepy_bits == 0 {
                        return;
                    }

                    continue;
                }

                let sleep_state = &self.sleep_states[i as usize];
                if (waker as usize) < self.sleep_states.len() {
                    sleep_state.next_target.store(waker, Ordering::Relaxed);
                }

                sleep_state.unparker.unpark();

                n -= 1;
                break;
            }
        }
    }

    fn mark_sleepy(&self, worker: u32) {
        self.sleepy_workers.fetch_or(1 << worker, Ordering::SeqCst);
    }

    fn mark_awake(&self, worker: u32) {
        // If someone already cleared the bit, it also unparked us and the next
        // `park` returns immediately, which is harmless.
        self.sleepy_workers.fetch_and(!(1 << worker), Ordering::SeqCst);
    }

    fn get_waker_hint(&self, worker_index: usize) -> usize {
        self.sleep_states[worker_index]
            .next_target
            .load(Ordering::Relaxed) as usize
    }

    fn set_waker_hint(&self, worker_index: usize, waker: usize) {
        self.sleep_states[worker_index]
            .next_target
            .store(waker as u32, Ordering::Release);
    }

    fn wake_all(&self) {
        for state in &self.sleep_states {
            state.unparker.unpark();
        }
    }
}

struct Shutdown {
    is_shutting_down: AtomicBool,
    /// Number of workers that haven't shut down yet.
    running: Mutex<u32>,
    cond: Condvar,
}

impl Shutdown {
    fn new(num_workers: u32) -> Self {
        Shutdown {
            is_shutting_down: AtomicBool::new(false),
            running: Mutex::new(num_workers),
            cond: Condvar::new(),
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    fn forget_workers(&self, count: u32) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        *running -= count;
    }

    fn worker_has_shut_down(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        *running -= 1;
        if *running == 0 {
            self.cond.notify_all();
        }
    }
}

pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    /// Block until every worker has drained the remaining work and stopped.
    pub fn wait(self) {
        let shutdown = &self.shared.shutdown;
        let mut running = shutdown.running.lock().unwrap_or_else(PoisonError::into_inner);
        while *running > 0 {
            running = shutdown.cond.wait(running).unwrap_or_else(PoisonError::into_inner);
        }

        log::debug!("thread pool {:?} shut down", self.shared.id);
    }
}

struct ThreadPoolHooks {
    start: Option<Box<dyn WorkerHook>>,
    exit: Option<Box<dyn WorkerHook>>,
}

pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_id: u32) { self(worker_id) }
}

#[test]
fn spawn_many() {
    use std::sync::mpsc;

    let pool = ThreadPool::builder().with_worker_threads(3).build().unwrap();

    let (tx, rx) = mpsc::channel();
    for i in 0..10_000u64 {
        let tx = tx.clone();
        pool.spawn(move || {
            tx.send(i).unwrap();
        });
    }
    drop(tx);

    let sum: u64 = rx.iter().sum();
    assert_eq!(sum, (0..10_000u64).sum());

    pool.shut_down().wait();
}

#[test]
fn nested_spawn_uses_current_pool() {
    use std::sync::mpsc;

    let pool = ThreadPool::builder().with_worker_threads(2).build().unwrap();
    assert!(ThreadPool::current().is_none());

    let (tx, rx) = mpsc::channel();
    let p2 = pool.clone();
    pool.spawn(move || {
        let current = ThreadPool::current().unwrap();
        assert!(current.ptr_eq(&p2));
        assert!(ThreadPool::current_worker_index().unwrap() < 2);

        for _ in 0..100 {
            let tx = tx.clone();
            current.spawn(move || {
                tx.send(ThreadPool::current_worker_index()).unwrap();
            });
        }
    });

    let indices: Vec<Option<u32>> = rx.iter().take(100).collect();
    assert!(indices.iter().all(|idx| idx.map_or(false, |idx| idx < 2)));

    pool.shut_down().wait();
}

#[test]
fn hooks_and_shutdown() {
    let started = Arc::new(AtomicU32::new(0));
    let stopped = Arc::new(AtomicU32::new(0));
    let s1 = started.clone();
    let s2 = stopped.clone();

    let pool = ThreadPool::builder()
        .with_worker_threads(4)
        .with_thread_names(|idx| format!("test-worker-{}", idx))
        .with_start_handler(move |_| { s1.fetch_add(1, Ordering::SeqCst); })
        .with_exit_handler(move |_| { s2.fetch_add(1, Ordering::SeqCst); })
        .build()
        .unwrap();

    assert_eq!(pool.num_worker_threads(), 4);

    let ran = Arc::new(AtomicU32::new(0));
    for _ in 0..64 {
        let ran = ran.clone();
        pool.spawn(move || { ran.fetch_add(1, Ordering::SeqCst); });
    }

    pool.shut_down().wait();

    assert_eq!(ran.load(Ordering::SeqCst), 64);
    assert_eq!(started.load(Ordering::SeqCst), 4);
    assert_eq!(stopped.load(Ordering::SeqCst), 4);
}

#[test]
fn panicking_job_keeps_worker_alive() {
    use std::sync::mpsc;

    let pool = ThreadPool::builder().with_worker_threads(1).build().unwrap();

    pool.spawn(|| panic!("job failure"));

    let (tx, rx) = mpsc::channel();
    pool.spawn(move || { tx.send(42).unwrap(); });
    assert_eq!(rx.recv().unwrap(), 42);

    pool.shut_down().wait();
}
