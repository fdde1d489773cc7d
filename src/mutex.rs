use std::marker::PhantomData;
use std::panic;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_utils::Backoff;

use crate::arena::Arena;
use crate::residency::ResidencyTracker;
use crate::rw_lock::RwLock;
use crate::task_group::{Scope, TaskGroup};
use crate::thread_pool::ThreadPool;

/// Mutex where threads waiting for access can collaborate on the work
/// spawned by the holder. Useful for performing expensive delayed
/// initialisation of shared resources.
///
/// Simple usage:
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use task_mutex::{ScopedLock, TaskMutex};
///
/// static INITIALISED: AtomicBool = AtomicBool::new(false);
/// static MUTEX: TaskMutex = TaskMutex::new();
///
/// let mut lock = ScopedLock::new(&MUTEX, true, true);
/// if !INITIALISED.load(Ordering::Acquire) {
///     // Threads waiting on `MUTEX` help with the jobs spawned here.
///     lock.execute(|scope| {
///         for _ in 0..4 {
///             scope.spawn(|_| { /* part of the expensive initialisation */ });
///         }
///     });
///     INITIALISED.store(true, Ordering::Release);
/// }
/// // Use the resource here, while the lock is still held.
/// ```
///
/// Improved performance via reader locks:
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use task_mutex::{ScopedLock, TaskMutex};
///
/// static INITIALISED: AtomicBool = AtomicBool::new(false);
/// static MUTEX: TaskMutex = TaskMutex::new();
///
/// // Optimistically take a reader lock, sufficient to read from the resource
/// // if it is already initialised.
/// let mut lock = ScopedLock::new(&MUTEX, false, true);
/// if !INITIALISED.load(Ordering::Acquire) {
///     // Upgrade to a writer lock so we can initialise the shared resource.
///     lock.upgrade_to_writer();
///     // Check again, we may not be the first to get the writer lock.
///     if !INITIALISED.load(Ordering::Acquire) {
///         lock.execute(|_| { /* expensive initialisation */ });
///         INITIALISED.store(true, Ordering::Release);
///     }
/// }
/// // Use the resource here, while the lock is still held.
/// ```
pub struct TaskMutex {
    // The actual lock held by `ScopedLock`.
    lock: RwLock,
    // Set while a `ScopedLock::execute` call is in flight.
    execution_state: Mutex<Option<Arc<ExecutionState>>>,
    thread_pool: Option<ThreadPool>,
}

impl TaskMutex {
    pub const fn new() -> Self {
        TaskMutex {
            lock: RwLock::new(),
            execution_state: Mutex::new(None),
            thread_pool: None,
        }
    }

    /// Create a mutex whose `execute` calls invite `thread_pool`'s workers to help.
    ///
    /// Without it, the pool of the worker thread calling `execute` is used, if any.
    pub fn with_thread_pool(thread_pool: ThreadPool) -> Self {
        TaskMutex {
            lock: RwLock::new(),
            execution_state: Mutex::new(None),
            thread_pool: Some(thread_pool),
        }
    }

    /// Returns true while some thread is inside `ScopedLock::execute` for this mutex.
    pub fn is_executing(&self) -> bool {
        self.lock_execution_state().is_some()
    }

    fn thread_pool(&self) -> Option<ThreadPool> {
        self.thread_pool.clone().or_else(ThreadPool::current)
    }

    fn lock_execution_state(&self) -> MutexGuard<Option<Arc<ExecutionState>>> {
        // Only ever holds a pointer, which is never left half-written.
        self.execution_state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TaskMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TaskMutex")
            .field("lock", &self.lock)
            .field("executing", &self.is_executing())
            .finish()
    }
}

// The mechanism we use to allow waiting threads to participate in the work
// done by `execute()`.
struct ExecutionState {
    // Arena and task group used to allow waiting threads to participate in work.
    arena: Arena,
    group: TaskGroup,
    // Tracks which threads are currently inside the arena.
    residents: Arc<ResidencyTracker>,
}

impl ExecutionState {
    fn new(thread_pool: Option<ThreadPool>) -> Self {
        let arena = match thread_pool {
            Some(pool) => Arena::with_thread_pool(pool),
            None => Arena::new(),
        };

        let residents = Arc::new(ResidencyTracker::new());
        arena.observe(residents.clone());

        let group = TaskGroup::new(&arena);

        ExecutionState { arena, group, residents }
    }
}

/// Unpublishes the execution state when `execute` is done, even if it unwinds.
struct PublishedState<'m> {
    mutex: &'m TaskMutex,
}

impl<'m> Drop for PublishedState<'m> {
    fn drop(&mut self) {
        self.mutex.lock_execution_state().take();
        log::trace!("execution state cleared");
    }
}

/// Used to acquire a lock on a `TaskMutex` and release it automatically.
///
/// A `ScopedLock` holds at most one lock at a time: it must be released before it
/// can acquire again. It is bound to the thread that acquired it.
pub struct ScopedLock<'m> {
    mutex: Option<&'m TaskMutex>,
    writer: bool,
    recursive: bool,
    // Recursive locks are only valid on the thread that was granted them.
    _not_send: PhantomData<*const ()>,
}

impl<'m> ScopedLock<'m> {
    pub fn unlocked() -> Self {
        ScopedLock {
            mutex: None,
            writer: false,
            recursive: false,
            _not_send: PhantomData,
        }
    }

    /// Acquire a lock on `mutex`, see `acquire`.
    pub fn new(mutex: &'m TaskMutex, write: bool, accept_work: bool) -> Self {
        let mut lock = Self::unlocked();
        lock.acquire(mutex, write, accept_work);

        lock
    }

    /// Acquire a writer lock on `mutex`, helping with any work being executed.
    pub fn writer(mutex: &'m TaskMutex) -> Self {
        Self::new(mutex, true, true)
    }

    /// Acquires a lock on `mutex`. If `accept_work` is true, then may perform
    /// work on behalf of `execute()` while waiting.
    pub fn acquire(&mut self, mutex: &'m TaskMutex, write: bool, accept_work: bool) {
        let backoff = Backoff::new();
        while !self.acquire_or(mutex, write, |_| accept_work) {
            backoff.snooze();
        }
    }

    /// Acquires `mutex` or returns false. Never does any work.
    pub fn try_acquire(&mut self, mutex: &'m TaskMutex, write: bool) -> bool {
        self.acquire_or(mutex, write, |_| false)
    }

    /// Tries to acquire the mutex, returning true on success. On failure,
    /// calls `work_notifier(work_available)`. If work is available and
    /// `work_notifier` returns true, then this thread will perform jobs
    /// spawned by `execute()` until the work is complete. Returns false on
    /// failure regardless of whether or not work is done.
    pub fn acquire_or<N>(&mut self, mutex: &'m TaskMutex, write: bool, work_notifier: N) -> bool
    where
        N: FnOnce(bool) -> bool,
    {
        debug_assert!(self.mutex.is_none(), "ScopedLock is already locked");

        let acquired = if write { mutex.lock.try_lock() } else { mutex.lock.try_lock_shared() };
        if acquired {
            self.mutex = Some(mutex);
            self.writer = write;
            self.recursive = false;
            return true;
        }

        // Failed to acquire the mutex by regular means. We now need to consider
        // our interaction with any execution state introduced by a current call
        // to `execute()`.

        let execution_state = {
            let current = mutex.lock_execution_state();
            match current.as_ref() {
                Some(state) if state.residents.contains_current_thread() => {
                    // We're already doing work on behalf of `execute()`, so we can
                    // take a recursive lock.
                    self.mutex = Some(mutex);
                    self.writer = false;
                    self.recursive = true;
                    return true;
                }
                Some(state) => Some(state.clone()),
                None => None,
            }
        };

        let work_available = execution_state.is_some();
        if !work_notifier(work_available) {
            return false;
        }

        let Some(execution_state) = execution_state else {
            return false;
        };

        // Perform work on behalf of `execute()`.
        profiling::scope!("TaskMutex: helping");
        execution_state.arena.execute(|| execution_state.group.wait());

        false
    }

    /// Upgrades a previously-acquired reader lock to a full writer
    /// lock. Returns true if the upgrade was achieved without
    /// temporarily releasing the lock, and false otherwise.
    pub fn upgrade_to_writer(&mut self) -> bool {
        let mutex = self.held("upgrade_to_writer");
        debug_assert!(!self.writer && !self.recursive, "upgrade_to_writer() requires a non-recursive reader lock");

        self.writer = true;

        mutex.lock.upgrade()
    }

    /// Calls `f` in a way that allows threads waiting for the lock to perform
    /// the jobs it spawns on its behalf. Should only be called by the holder of a
    /// writer lock.
    ///
    /// Returns once `f` and everything it spawned, directly or not, has completed.
    /// If any of it panicked, the panic is resumed here once the waiting threads
    /// have been let go.
    pub fn execute<'scope, F, R>(&mut self, f: F) -> R
    where
        F: FnOnce(&Scope<'scope>) -> R + Send,
        R: Send,
    {
        let mutex = self.held("execute");
        debug_assert!(self.writer && !self.recursive, "execute() requires a non-recursive writer lock");

        profiling::scope!("TaskMutex::execute");

        let state = Arc::new(ExecutionState::new(mutex.thread_pool()));

        let published = {
            let mut current = mutex.lock_execution_state();
            debug_assert!(current.is_none(), "execute() is already in flight");
            *current = Some(state.clone());

            PublishedState { mutex }
        };
        log::trace!("execution state published in arena {:?}", state.arena.id());

        let mut output = None;
        state.arena.execute(|| {
            // `f` itself goes through the arena's queue, any participant may run it.
            let output = &mut output;
            // SAFETY: `output` and whatever `f` borrows outlive the wait right below,
            // which doesn't return before `f` and every job it spawned are done.
            unsafe {
                state.group.run_unchecked(move |scope| {
                    *output = Some(f(scope));
                });
            }
            state.group.wait();
        });

        drop(published);
        let panic = state.group.take_panic();
        drop(state);

        if let Some(payload) = panic {
            panic::resume_unwind(payload);
        }

        match output {
            Some(output) => output,
            None => unreachable!("execute() finished without running its function"),
        }
    }

    /// Releases the lock. This will be done automatically when the `ScopedLock`
    /// is dropped, but may be called explicitly to release the lock early.
    pub fn release(&mut self) {
        let mutex = self.held("release");
        if !self.recursive {
            if self.writer {
                mutex.lock.unlock();
            } else {
                mutex.lock.unlock_shared();
            }
        }

        self.mutex = None;
        self.writer = false;
        self.recursive = false;
    }

    /// Returns true if `acquire()` obtained a recursive lock rather
    /// than a unique lock. Recursive locks are available to any thread
    /// performing work on behalf of `execute()`.
    pub fn recursive(&self) -> bool {
        self.recursive
    }

    pub fn is_locked(&self) -> bool {
        self.mutex.is_some()
    }

    pub fn is_writer(&self) -> bool {
        self.mutex.is_some() && self.writer
    }

    fn held(&self, operation: &str) -> &'m TaskMutex {
        match self.mutex {
            Some(mutex) => mutex,
            None => panic!("ScopedLock::{}() called without holding a lock", operation),
        }
    }
}

impl<'m> Drop for ScopedLock<'m> {
    fn drop(&mut self) {
        if self.mutex.is_some() {
            self.release();
        }
    }
}

impl<'m> Default for ScopedLock<'m> {
    fn default() -> Self {
        Self::unlocked()
    }
}

#[test]
fn sequential_use() {
    let mutex = TaskMutex::new();

    let mut lock = ScopedLock::writer(&mutex);
    assert!(lock.is_writer());
    assert!(!lock.recursive());
    lock.execute(|_| {});
    assert!(!mutex.is_executing());
    assert!(!lock.recursive());
    lock.release();
    assert!(!lock.is_locked());

    lock.acquire(&mutex, false, true);
    assert!(lock.is_locked());
    assert!(!lock.is_writer());
    assert!(!lock.recursive());
    lock.release();

    assert!(lock.try_acquire(&mutex, true));
    assert!(!lock.recursive());
}

#[test]
fn try_acquire_fails_when_held() {
    let mutex = TaskMutex::new();

    let _reader = ScopedLock::new(&mutex, false, true);

    let mut other = ScopedLock::unlocked();
    assert!(other.try_acquire(&mutex, false));
    other.release();
    assert!(!other.try_acquire(&mutex, true));
    assert!(!other.is_locked());
}

#[test]
fn execute_returns_output() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let mutex = TaskMutex::new();
    let counter = AtomicU32::new(0);

    let mut lock = ScopedLock::writer(&mutex);
    let output = lock.execute(|scope| {
        for _ in 0..16 {
            scope.spawn(|scope| {
                counter.fetch_add(1, Ordering::SeqCst);
                scope.spawn(|_| { counter.fetch_add(1, Ordering::SeqCst); });
            });
        }
        "done"
    });

    assert_eq!(output, "done");
    assert_eq!(counter.load(Ordering::SeqCst), 32);
}

#[test]
fn recursive_lock_from_execute() {
    let mutex = TaskMutex::new();

    let mut lock = ScopedLock::writer(&mutex);
    let recursive = lock.execute(|scope| {
        let mut nested = ScopedLock::writer(&mutex);
        assert!(nested.recursive());
        assert!(!nested.is_writer());
        nested.release();

        scope.spawn(|_| {
            let mut nested = ScopedLock::unlocked();
            assert!(nested.try_acquire(&mutex, false));
            assert!(nested.recursive());
        });

        true
    });

    assert!(recursive);
    assert!(!lock.recursive());
}

#[test]
fn panic_in_execute_is_propagated() {
    let mutex = TaskMutex::new();

    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let mut lock = ScopedLock::writer(&mutex);
        lock.execute(|scope| {
            scope.spawn(|_| panic!("broken initialisation"));
        });
    }));

    assert!(result.is_err());
    assert!(!mutex.is_executing());

    // The lock was released while unwinding.
    let mut lock = ScopedLock::unlocked();
    assert!(lock.try_acquire(&mutex, true));
}

#[test]
fn upgrade_without_contention_is_fast() {
    let mutex = TaskMutex::new();

    let mut lock = ScopedLock::new(&mutex, false, true);
    assert!(lock.upgrade_to_writer());
    assert!(lock.is_writer());

    let mut other = ScopedLock::unlocked();
    assert!(!other.try_acquire(&mutex, false));

    lock.execute(|_| {});
}

#[test]
#[cfg(debug_assertions)]
#[should_panic]
fn execute_requires_writer() {
    let mutex = TaskMutex::new();
    let mut lock = ScopedLock::new(&mutex, false, true);
    lock.execute(|_| {});
}

#[test]
#[should_panic]
fn release_twice() {
    let mutex = TaskMutex::new();
    let mut lock = ScopedLock::writer(&mutex);
    lock.release();
    lock.release();
}
