//! A reader-writer mutex whose waiters help out with the work of the thread
//! holding it.
//!
//! The typical use is expensive, lazy initialisation of shared resources: the
//! first thread to get the writer lock runs the initialisation through
//! `ScopedLock::execute`, and the threads that would otherwise block on the lock
//! execute the jobs it spawns instead of sitting idle.
//!
//! What we want:
//! - No deadlock when the work done under the lock needs the lock again. Threads
//!   running jobs for `execute` are granted recursive locks.
//! - Waiting threads only ever pick up work belonging to the lock they wait for.
//! - An ordinary reader-writer lock when nobody calls `execute`.
//!
//! The executor underneath (thread pool, arenas and task groups) is small and only
//! built for this purpose. Part of the code was adapted from rayon (JobRef, HeapJob).

mod arena;
mod job;
mod mutex;
mod once;
mod residency;
mod rw_lock;
mod task_group;
mod thread_pool;

use std::sync::atomic::{AtomicBool, Ordering};

pub use arena::{Arena, ArenaId, ArenaObserver};
pub use mutex::{ScopedLock, TaskMutex};
pub use once::TaskOnceCell;
pub use residency::ResidencyTracker;
pub use rw_lock::RwLock;
pub use task_group::{Scope, TaskGroup};
pub use thread_pool::{ShutdownHandle, ThreadPool, ThreadPoolBuilder, ThreadPoolId, WorkerHook};

/// Helper to check that some code is never executed by two threads at once.
///
/// Test support, not part of the supported API.
#[doc(hidden)]
pub struct ExclusiveCheck<T> {
    lock: AtomicBool,
    tag: T,
}

impl<T: std::fmt::Debug> ExclusiveCheck<T> {
    pub fn new() -> Self where T: Default {
        ExclusiveCheck {
            lock: AtomicBool::new(false),
            tag: Default::default(),
        }
    }

    pub fn with_tag(tag: T) -> Self {
        ExclusiveCheck {
            lock: AtomicBool::new(false),
            tag,
        }
    }

    pub fn begin(&self) {
        let res = self.lock.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed);
        assert!(res.is_ok(), "Exclusive check failed (begin): {:?}", self.tag);
    }

    pub fn end(&self) {
        let res = self.lock.compare_exchange(true, false, Ordering::Release, Ordering::Relaxed);
        assert!(res.is_ok(), "Exclusive check failed (end): {:?}", self.tag);
    }
}

#[test]
fn exclusive_check_sequential() {
    let check = ExclusiveCheck::with_tag("sequential");

    check.begin();
    check.end();

    check.begin();
    check.end();
}

#[test]
#[should_panic]
fn exclusive_check_overlap() {
    let check: ExclusiveCheck<()> = ExclusiveCheck::new();

    check.begin();
    check.begin();
}

#[test]
fn writers_do_not_overlap_with_helpers() {
    use std::sync::atomic::AtomicU32;

    let pool = ThreadPool::builder().with_worker_threads(3).build().unwrap();
    let mutex = TaskMutex::with_thread_pool(pool.clone());
    let check = ExclusiveCheck::with_tag("task mutex");
    let counter = AtomicU32::new(0);

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..50 {
                    let mut lock = ScopedLock::writer(&mutex);
                    check.begin();
                    lock.execute(|scope| {
                        for _ in 0..8 {
                            scope.spawn(|_| { counter.fetch_add(1, Ordering::SeqCst); });
                        }
                    });
                    check.end();
                }
            });
        }
    });

    assert_eq!(counter.load(Ordering::SeqCst), 4 * 50 * 8);

    pool.shut_down().wait();
}
