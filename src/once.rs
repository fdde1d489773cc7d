use std::fmt;
use std::sync::OnceLock;

use crate::mutex::{ScopedLock, TaskMutex};
use crate::task_group::Scope;

/// A cell that is written once, by initialisation work that the threads waiting
/// for it help complete.
///
/// Reads are lock-free once the value is set.
pub struct TaskOnceCell<T> {
    value: OnceLock<T>,
    mutex: TaskMutex,
}

impl<T> TaskOnceCell<T> {
    pub const fn new() -> Self {
        TaskOnceCell {
            value: OnceLock::new(),
            mutex: TaskMutex::new(),
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.value.get()
    }

    /// Returns the value, initialising it with `init` if this is the first call.
    ///
    /// `init` is executed at most once at a time, and never again once it succeeded.
    /// The jobs it spawns may be executed by any thread blocked in `get_or_init` on
    /// the same cell. If `init` panics, the panic is propagated to the caller and
    /// the cell stays empty.
    ///
    /// Panics if called recursively from the initialisation of the same cell.
    pub fn get_or_init<'scope, F>(&self, init: F) -> &T
    where
        F: FnOnce(&Scope<'scope>) -> T + Send,
        T: Send,
    {
        if let Some(value) = self.value.get() {
            return value;
        }

        // Optimistically take a reader lock, someone else may be done initialising
        // by the time we get it.
        let mut lock = ScopedLock::new(&self.mutex, false, true);
        assert!(!lock.recursive(), "TaskOnceCell initialised recursively");

        if self.value.get().is_none() {
            lock.upgrade_to_writer();
            // Another writer may have gone first while upgrading.
            if self.value.get().is_none() {
                profiling::scope!("TaskOnceCell init");
                let value = lock.execute(init);
                if self.value.set(value).is_err() {
                    unreachable!("TaskOnceCell written outside of its writer lock");
                }
            }
        }

        drop(lock);

        match self.value.get() {
            Some(value) => value,
            None => unreachable!("TaskOnceCell left empty after initialisation"),
        }
    }

    pub fn into_inner(self) -> Option<T> {
        self.value.into_inner()
    }
}

impl<T> Default for TaskOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for TaskOnceCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TaskOnceCell").field(&self.value.get()).finish()
    }
}

#[test]
fn init_once() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let cell = TaskOnceCell::new();
    let calls = AtomicU32::new(0);

    assert!(cell.get().is_none());

    let value = cell.get_or_init(|_| {
        calls.fetch_add(1, Ordering::SeqCst);
        42
    });
    assert_eq!(*value, 42);

    let value = cell.get_or_init(|_| {
        calls.fetch_add(1, Ordering::SeqCst);
        0
    });
    assert_eq!(*value, 42);
    assert_eq!(cell.get(), Some(&42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cell.into_inner(), Some(42));
}

#[test]
fn concurrent_init() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    let cell: TaskOnceCell<u32> = TaskOnceCell::new();
    let calls = AtomicU32::new(0);
    let jobs = AtomicU32::new(0);

    thread::scope(|s| {
        for _ in 0..16 {
            s.spawn(|| {
                let value = cell.get_or_init(|scope| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    for _ in 0..100 {
                        scope.spawn(|_| {
                            jobs.fetch_add(1, Ordering::SeqCst);
                            thread::yield_now();
                        });
                    }
                    7
                });
                assert_eq!(*value, 7);
            });
        }
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(jobs.load(Ordering::SeqCst), 100);
}

#[test]
fn failed_init_can_be_retried() {
    let cell = TaskOnceCell::new();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        cell.get_or_init(|_| -> u32 { panic!("not today") });
    }));
    assert!(result.is_err());
    assert!(cell.get().is_none());

    assert_eq!(*cell.get_or_init(|_| 3), 3);
}

#[test]
#[should_panic]
fn recursive_init() {
    let cell: TaskOnceCell<u32> = TaskOnceCell::new();
    cell.get_or_init(|_| *cell.get_or_init(|_| 1) + 1);
}
