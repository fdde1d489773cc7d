//! Arenas are isolated execution contexts.
//!
//! Work pushed into an arena is only ever executed by threads that are inside
//! it: threads that called `Arena::execute`, and, if the arena is attached to a
//! thread pool, workers that were invited in to help. A thread waiting inside an
//! arena only picks up that arena's jobs, never unrelated work from elsewhere.
//!
//! Observers are told whenever a thread enters or leaves. A thread stays in an
//! arena as long as one of its `execute` calls for that arena is on the stack,
//! even while it runs nested work in another arena. Entering an arena that is
//! already further down the stack is not reported again, and the exit is only
//! reported when the outermost of these calls returns.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{self, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::Backoff;

use crate::job::JobRef;
use crate::thread_pool::ThreadPool;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArenaId(u64);

/// Hooks fired on the thread entering or leaving an arena.
///
/// Calls are symmetric: every `on_entry` is followed by exactly one `on_exit` for
/// the same thread, even if the work executed in between panics.
pub trait ArenaObserver: Send + Sync {
    fn on_entry(&self, thread: ThreadId);
    fn on_exit(&self, thread: ThreadId);
}

/// A reference to an arena.
#[derive(Clone)]
pub struct Arena {
    shared: Arc<ArenaShared>,
}

pub(crate) struct ArenaShared {
    id: ArenaId,
    queue: Injector<JobRef>,
    observers: Mutex<Vec<Arc<dyn ArenaObserver>>>,

    // As a last resort, participants that have nothing to do block on this condition
    // variable until a job is pushed or some work completes.
    sleep_mutex: Mutex<()>,
    sleep_cond: Condvar,
    sleepers: AtomicUsize,

    thread_pool: Option<ThreadPool>,
    // Number of helper jobs currently scheduled on or running in the thread pool.
    helpers: AtomicU32,
}

thread_local! {
    // The arenas the current thread is executing in, innermost last.
    static ARENA_STACK: RefCell<Vec<Arc<ArenaShared>>> = const { RefCell::new(Vec::new()) };
}

impl Arena {
    /// Create an arena that only the threads calling `execute` participate in.
    pub fn new() -> Self {
        Self::with_options(None)
    }

    /// Create an arena that also invites the pool's workers to help whenever work
    /// is pushed into it.
    pub fn with_thread_pool(thread_pool: ThreadPool) -> Self {
        Self::with_options(Some(thread_pool))
    }

    fn with_options(thread_pool: Option<ThreadPool>) -> Self {
        Arena {
            shared: Arc::new(ArenaShared {
                id: ArenaId(NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed)),
                queue: Injector::new(),
                observers: Mutex::new(Vec::new()),
                sleep_mutex: Mutex::new(()),
                sleep_cond: Condvar::new(),
                sleepers: AtomicUsize::new(0),
                thread_pool,
                helpers: AtomicU32::new(0),
            }),
        }
    }

    pub fn id(&self) -> ArenaId {
        self.shared.id
    }

    pub fn thread_pool(&self) -> Option<&ThreadPool> {
        self.shared.thread_pool.as_ref()
    }

    /// Register an observer.
    ///
    /// Must happen before any thread enters the arena, otherwise the observer
    /// sees exits without the matching entries.
    pub fn observe(&self, observer: Arc<dyn ArenaObserver>) {
        lock(&self.shared.observers).push(observer);
    }

    /// Returns true if the current thread is executing inside this arena.
    pub fn is_current(&self) -> bool {
        ARENA_STACK.with(|stack| {
            stack.borrow().last().map_or(false, |arena| Arc::ptr_eq(arena, &self.shared))
        })
    }

    /// Run `f` on the current thread, inside of the arena.
    ///
    /// If this is the innermost arena the current thread executes in, `f` is simply
    /// called. If the arena is further down the thread's stack, the thread is already
    /// resident and observers aren't notified again.
    pub fn execute<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        if self.is_current() {
            return f();
        }

        let _activation = Activation::enter(&self.shared);

        f()
    }

    pub(crate) fn push(&self, job: JobRef) {
        self.shared.queue.push(job);
        self.shared.wake_participants();
        self.invite_workers();
    }

    /// Execute this arena's jobs until `done` returns true.
    ///
    /// Must be called from inside the arena. Spins for a little while when there is
    /// nothing to steal, then blocks until more work shows up or `done` may have
    /// changed.
    pub(crate) fn participate_until(&self, done: &dyn Fn() -> bool) {
        debug_assert!(self.is_current(), "participating in an arena from outside of it");

        let backoff = Backoff::new();
        loop {
            if let Some(job) = self.shared.pop() {
                // SAFETY: each job is popped exactly once.
                unsafe { job.execute(); }
                backoff.reset();
                continue;
            }

            if done() {
                return;
            }

            if !backoff.is_completed() {
                backoff.snooze();
                continue;
            }

            self.shared.sleep_until(&|| done() || !self.shared.queue.is_empty());
            backoff.reset();
        }
    }

    /// Wake the participants blocked in `participate_until` so that they check
    /// their exit condition again.
    pub(crate) fn notify(&self) {
        self.shared.wake_participants();
    }

    fn invite_workers(&self) {
        let Some(pool) = &self.shared.thread_pool else {
            return;
        };

        let max_helpers = pool.num_worker_threads();
        let invited = self.shared.helpers.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |helpers| {
            if helpers < max_helpers { Some(helpers + 1) } else { None }
        });

        if invited.is_err() {
            return;
        }

        let arena = self.clone();
        pool.spawn(move || {
            profiling::scope!("arena helper");
            arena.execute(|| arena.shared.drain());
            arena.shared.helpers.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.shared.id)
            .field("thread_pool", &self.shared.thread_pool)
            .finish()
    }
}

impl ArenaShared {
    fn pop(&self) -> Option<JobRef> {
        loop {
            match self.queue.steal() {
                Steal::Success(job) => return Some(job),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    fn drain(&self) {
        while let Some(job) = self.pop() {
            // SAFETY: each job is popped exactly once.
            unsafe { job.execute(); }
        }
    }

    fn sleep_until(&self, ready: &dyn Fn() -> bool) {
        profiling::scope!("arena sleep");

        let mut guard = lock(&self.sleep_mutex);
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        // Pairs with the fence in `wake_participants`: either the waker sees us
        // sleeping, or we see the state it published.
        atomic::fence(Ordering::SeqCst);
        while !ready() {
            guard = self.sleep_cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    fn wake_participants(&self) {
        atomic::fence(Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }

        let _guard = lock(&self.sleep_mutex);
        self.sleep_cond.notify_all();
    }

    fn notify_entry(&self, thread: ThreadId) {
        for observer in lock(&self.observers).iter() {
            observer.on_entry(thread);
        }
    }

    fn notify_exit(&self, thread: ThreadId) {
        for observer in lock(&self.observers).iter() {
            observer.on_exit(thread);
        }
    }
}

impl Drop for ArenaShared {
    fn drop(&mut self) {
        debug_assert!(self.queue.is_empty(), "arena {:?} destroyed with pending jobs", self.id);
    }
}

/// The current thread's stay in an arena. Leaves it when dropped.
struct Activation {
    arena: Arc<ArenaShared>,
}

impl Activation {
    fn enter(arena: &Arc<ArenaShared>) -> Self {
        let first = ARENA_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let first = !stack.iter().any(|entered| Arc::ptr_eq(entered, arena));
            stack.push(arena.clone());
            first
        });

        if first {
            arena.notify_entry(thread::current().id());
        }

        Activation { arena: arena.clone() }
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        let last = ARENA_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let top = stack.pop();
            debug_assert!(top.map_or(false, |top| Arc::ptr_eq(&top, &self.arena)));
            !stack.iter().any(|entered| Arc::ptr_eq(entered, &self.arena))
        });

        if last {
            self.arena.notify_exit(thread::current().id());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<(&'static str, ThreadId)>>,
}

#[cfg(test)]
impl ArenaObserver for EventLog {
    fn on_entry(&self, thread: ThreadId) { lock(&self.events).push(("entry", thread)); }
    fn on_exit(&self, thread: ThreadId) { lock(&self.events).push(("exit", thread)); }
}

#[test]
fn entry_and_exit() {
    let arena = Arena::new();
    let log = Arc::new(EventLog::default());
    arena.observe(log.clone());

    let me = thread::current().id();

    assert!(!arena.is_current());
    let value = arena.execute(|| {
        assert!(arena.is_current());
        // Re-entering is a no-op.
        arena.execute(|| assert!(arena.is_current()));
        42
    });
    assert_eq!(value, 42);
    assert!(!arena.is_current());

    assert_eq!(*lock(&log.events), vec![("entry", me), ("exit", me)]);
}

#[test]
fn nested_arenas() {
    let outer = Arena::new();
    let inner = Arena::new();
    let outer_log = Arc::new(EventLog::default());
    let inner_log = Arc::new(EventLog::default());
    outer.observe(outer_log.clone());
    inner.observe(inner_log.clone());

    let me = thread::current().id();

    outer.execute(|| {
        inner.execute(|| {
            assert!(inner.is_current());
            assert!(!outer.is_current());

            // Still in the outer arena, so coming back doesn't count as a new entry.
            outer.execute(|| assert!(outer.is_current()));
            assert!(inner.is_current());
        });
        assert!(outer.is_current());
    });

    assert_eq!(*lock(&outer_log.events), vec![("entry", me), ("exit", me)]);
    assert_eq!(*lock(&inner_log.events), vec![("entry", me), ("exit", me)]);
}

#[test]
fn exit_on_panic() {
    let arena = Arena::new();
    let log = Arc::new(EventLog::default());
    arena.observe(log.clone());

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        arena.execute(|| panic!("oops"));
    }));

    assert!(result.is_err());
    assert!(!arena.is_current());
    let events = lock(&log.events);
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].0, "exit");
}
