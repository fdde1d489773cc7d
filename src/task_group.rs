use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::arena::Arena;
use crate::job::HeapJob;

/// A set of jobs executed in an arena, and a way to wait for all of them.
///
/// Jobs scheduled with `run` may spawn more jobs into the same group through the
/// `Scope` they receive. `wait` returns once every one of them has completed.
pub struct TaskGroup {
    shared: Arc<GroupShared>,
}

struct GroupShared {
    arena: Arena,
    /// Number of jobs scheduled and not completed yet.
    pending: AtomicUsize,
    /// The first panic raised by a job of the group.
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl TaskGroup {
    pub fn new(arena: &Arena) -> Self {
        TaskGroup {
            shared: Arc::new(GroupShared {
                arena: arena.clone(),
                pending: AtomicUsize::new(0),
                panic: Mutex::new(None),
            }),
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.shared.arena
    }

    /// Schedule `f` into the arena as part of this group.
    pub fn run<F>(&self, f: F)
    where
        F: FnOnce(&Scope<'static>) + Send + 'static,
    {
        // SAFETY: nothing is borrowed.
        unsafe { spawn(&self.shared, f) }
    }

    /// Like `run`, without requiring `f` to be `'static`.
    ///
    /// Unsafe: the caller must `wait` for the group before anything `f` borrows
    /// goes out of scope.
    pub(crate) unsafe fn run_unchecked<'scope, F>(&self, f: F)
    where
        F: FnOnce(&Scope<'scope>) + Send,
    {
        spawn(&self.shared, f)
    }

    /// Wait until every job of the group has completed, executing the arena's jobs
    /// in the meantime.
    ///
    /// Must be called from inside the group's arena, see `Arena::execute`.
    /// Panics raised by the jobs are not propagated here, see `take_panic`.
    pub fn wait(&self) {
        profiling::scope!("TaskGroup::wait");

        let shared = &self.shared;
        shared.arena.participate_until(&|| shared.is_done());
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    /// Returns the payload of the first panic raised by one of the group's jobs, if any.
    pub fn take_panic(&self) -> Option<Box<dyn Any + Send>> {
        self.shared.panic.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl GroupShared {
    fn is_done(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }

    fn record_panic(&self, payload: Box<dyn Any + Send>) {
        let mut panic = self.panic.lock().unwrap_or_else(PoisonError::into_inner);
        if panic.is_none() {
            *panic = Some(payload);
        }
    }

    fn complete_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.arena.notify();
        }
    }
}

/// Handed to the jobs of a group to let them spawn more work into it.
///
/// Jobs spawned through a `Scope<'scope>` may borrow anything that outlives `'scope`.
pub struct Scope<'scope> {
    group: Arc<GroupShared>,
    marker: PhantomData<&'scope mut &'scope ()>,
}

impl<'scope> Scope<'scope> {
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce(&Scope<'scope>) + Send + 'scope,
    {
        // SAFETY: a `Scope<'scope>` is only handed out to jobs of a group whose
        // owner waits for it before `'scope` ends.
        unsafe { spawn(&self.group, f) }
    }

    pub fn arena(&self) -> &Arena {
        &self.group.arena
    }
}

unsafe fn spawn<'scope, F>(group: &Arc<GroupShared>, f: F)
where
    F: FnOnce(&Scope<'scope>) + Send,
{
    group.pending.fetch_add(1, Ordering::SeqCst);

    let scope = Scope {
        group: group.clone(),
        marker: PhantomData,
    };

    let job = HeapJob::new(move || {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f(&scope))) {
            scope.group.record_panic(payload);
        }
        scope.group.complete_one();
    });

    group.arena.push(job.into_job_ref());
}

#[test]
fn run_and_wait() {
    let arena = Arena::new();
    let group = TaskGroup::new(&arena);
    let counter = Arc::new(AtomicUsize::new(0));
    assert!(group.arena().thread_pool().is_none());

    for _ in 0..10 {
        let counter = counter.clone();
        group.run(move |scope| {
            for _ in 0..10 {
                let counter = counter.clone();
                scope.spawn(move |_| { counter.fetch_add(1, Ordering::SeqCst); });
            }
        });
    }

    assert!(!group.is_done());
    arena.execute(|| group.wait());

    assert!(group.is_done());
    assert_eq!(counter.load(Ordering::SeqCst), 100);
    assert!(group.take_panic().is_none());
}

#[test]
fn panics_are_captured() {
    let arena = Arena::new();
    let group = TaskGroup::new(&arena);

    group.run(|scope| {
        assert!(scope.arena().is_current());
        scope.spawn(|_| panic!("first"));
    });
    group.run(|_| {});

    arena.execute(|| group.wait());

    assert!(group.is_done());
    let payload = group.take_panic().unwrap();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"first"));
    assert!(group.take_panic().is_none());
}

#[test]
fn borrowed_data() {
    let arena = Arena::new();
    let group = TaskGroup::new(&arena);
    let mut values = vec![0u32; 64];

    arena.execute(|| {
        let chunks: Vec<&mut [u32]> = values.chunks_mut(8).collect();
        // SAFETY: we wait right below.
        unsafe {
            group.run_unchecked(move |scope| {
                for (i, chunk) in chunks.into_iter().enumerate() {
                    scope.spawn(move |_| {
                        for value in chunk.iter_mut() {
                            *value = i as u32;
                        }
                    });
                }
            });
        }
        group.wait();
    });

    for (i, value) in values.iter().enumerate() {
        assert_eq!(*value, (i / 8) as u32);
    }
}

#[test]
fn thread_pool_helps() {
    use crate::ThreadPool;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    let pool = ThreadPool::builder().with_worker_threads(3).build().unwrap();
    let arena = Arena::with_thread_pool(pool.clone());
    let group = TaskGroup::new(&arena);
    let threads = Arc::new(Mutex::new(HashSet::new()));

    let group_pool = group.arena().thread_pool().unwrap();
    assert_eq!(group_pool.id(), pool.id());
    assert_eq!(group.arena().id(), arena.id());

    arena.execute(|| {
        for _ in 0..32 {
            let threads = threads.clone();
            group.run(move |_| {
                thread::sleep(Duration::from_millis(2));
                threads.lock().unwrap().insert(thread::current().id());
            });
        }
        group.wait();
    });

    assert!(group.is_done());
    // At least one worker joined the current thread.
    assert!(threads.lock().unwrap().len() > 1);

    pool.shut_down().wait();
}
