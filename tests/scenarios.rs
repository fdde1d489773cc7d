use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Barrier, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use task_mutex::{ExclusiveCheck, ScopedLock, TaskMutex, TaskOnceCell, ThreadPool};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Counts the jobs executed by each thread.
#[derive(Default)]
struct WorkLog {
    per_thread: Mutex<HashMap<ThreadId, u32>>,
}

impl WorkLog {
    fn record(&self) {
        *self.per_thread.lock().unwrap().entry(thread::current().id()).or_insert(0) += 1;
    }

    fn count(&self, thread: ThreadId) -> u32 {
        self.per_thread.lock().unwrap().get(&thread).copied().unwrap_or(0)
    }

    fn total(&self) -> u32 {
        self.per_thread.lock().unwrap().values().sum()
    }
}

fn wait_until_executing(mutex: &TaskMutex) {
    while !mutex.is_executing() {
        thread::yield_now();
    }
}

#[test]
fn waiting_reader_helps_the_writer() {
    init_logger();

    const JOBS: u32 = 32;

    let mutex = TaskMutex::new();
    let log = WorkLog::default();

    thread::scope(|s| {
        let writer = s.spawn(|| {
            let mut lock = ScopedLock::writer(&mutex);
            lock.execute(|scope| {
                for _ in 0..JOBS {
                    scope.spawn(|_| {
                        thread::sleep(Duration::from_millis(5));
                        log.record();
                    });
                }
            });
        });

        wait_until_executing(&mutex);

        let reader = s.spawn(|| {
            let lock = ScopedLock::new(&mutex, false, true);
            assert!(!lock.recursive());
            thread::current().id()
        });

        let reader = reader.join().unwrap();
        writer.join().unwrap();

        assert_eq!(log.total(), JOBS);
        assert!(log.count(reader) > 0);
    });
}

#[test]
fn try_acquire_never_does_work() {
    init_logger();

    let mutex = TaskMutex::new();
    let log = WorkLog::default();
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            let mut lock = ScopedLock::writer(&mutex);
            lock.execute(|scope| {
                for _ in 0..16 {
                    scope.spawn(|_| {
                        thread::sleep(Duration::from_millis(2));
                        log.record();
                    });
                }
            });
            done.store(true, Ordering::SeqCst);
        });

        wait_until_executing(&mutex);

        let contender = s.spawn(|| {
            let mut lock = ScopedLock::unlocked();
            let mut declined = 0;
            while !done.load(Ordering::SeqCst) {
                if lock.try_acquire(&mutex, false) {
                    lock.release();
                } else {
                    declined += 1;
                }
                // Declining the offer to help is as good as probing.
                if lock.acquire_or(&mutex, true, |_| false) {
                    lock.release();
                }
            }
            (thread::current().id(), declined)
        });

        let (contender, declined) = contender.join().unwrap();
        assert!(declined > 0);
        assert_eq!(log.count(contender), 0);
    });

    assert_eq!(log.total(), 16);
}

#[test]
fn work_notifier_sees_available_work() {
    let mutex = TaskMutex::new();
    let looked = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            let mut lock = ScopedLock::writer(&mutex);
            lock.execute(|_| {
                // Keep the execution in flight until the other thread had a look.
                while !looked.load(Ordering::SeqCst) {
                    thread::yield_now();
                }
            });
        });

        wait_until_executing(&mutex);

        let mut lock = ScopedLock::unlocked();
        let mut work_available = false;
        let acquired = lock.acquire_or(&mutex, false, |available| {
            work_available = available;
            false
        });
        assert!(!acquired);
        assert!(work_available);

        looked.store(true, Ordering::SeqCst);
    });

    // Nothing is in flight anymore, and the lock is free.
    let mut lock = ScopedLock::unlocked();
    let mut called = false;
    assert!(lock.acquire_or(&mutex, true, |_| { called = true; true }));
    assert!(!called);
}

#[test]
fn nested_lock_is_recursive() {
    let mutex = TaskMutex::new();
    let nested_jobs = AtomicU32::new(0);

    let mut lock = ScopedLock::writer(&mutex);
    lock.execute(|scope| {
        for _ in 0..8 {
            scope.spawn(|_| {
                let nested = ScopedLock::new(&mutex, true, true);
                assert!(nested.recursive());
                nested_jobs.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    assert_eq!(nested_jobs.load(Ordering::SeqCst), 8);
    assert!(!lock.recursive());
    assert!(lock.is_writer());
}

#[test]
fn nested_execute_keeps_recursive_access() {
    init_logger();

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let outer = TaskMutex::new();
        let inner = TaskMutex::new();
        let nested_jobs = AtomicU32::new(0);

        let recursive = ScopedLock::writer(&outer).execute(|_| {
            // Work for `outer` taking another mutex's writer lock and executing under it.
            ScopedLock::writer(&inner).execute(|scope| {
                for _ in 0..4 {
                    scope.spawn(|_| {
                        let nested = ScopedLock::writer(&outer);
                        assert!(nested.recursive());
                        nested_jobs.fetch_add(1, Ordering::SeqCst);
                    });
                }

                let nested = ScopedLock::writer(&outer);
                nested.recursive()
            })
        });

        tx.send((recursive, nested_jobs.load(Ordering::SeqCst))).unwrap();
    });

    let (recursive, nested_jobs) = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("locking the outer mutex from nested work never returned");
    assert!(recursive);
    assert_eq!(nested_jobs, 4);
}

#[test]
fn plain_writer_offers_no_work() {
    let mutex = TaskMutex::new();
    let writer = ScopedLock::writer(&mutex);

    thread::scope(|s| {
        s.spawn(|| {
            let mut lock = ScopedLock::unlocked();
            let mut called = false;
            let mut work_available = false;
            let acquired = lock.acquire_or(&mutex, false, |available| {
                called = true;
                work_available = available;
                true
            });

            assert!(!acquired);
            assert!(called);
            assert!(!work_available);
            assert!(!lock.is_locked());
            assert!(!lock.recursive());
        });
    });

    assert!(writer.is_writer());
    drop(writer);

    // Nothing was left locked by the declined attempt.
    let mut lock = ScopedLock::unlocked();
    assert!(lock.try_acquire(&mutex, true));
}

#[test]
fn upgrade_race() {
    init_logger();

    for _ in 0..20 {
        let mutex = TaskMutex::new();
        let barrier = Barrier::new(2);
        let check = ExclusiveCheck::with_tag("upgraded writers");
        let fast_upgrades = AtomicU32::new(0);

        thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    let mut lock = ScopedLock::new(&mutex, false, true);
                    barrier.wait();

                    if lock.upgrade_to_writer() {
                        fast_upgrades.fetch_add(1, Ordering::SeqCst);
                    }
                    assert!(lock.is_writer());

                    check.begin();
                    lock.execute(|_| thread::sleep(Duration::from_millis(1)));
                    check.end();
                });
            }
        });

        assert_eq!(fast_upgrades.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn readers_wait_for_the_writer() {
    init_logger();

    for num_threads in [1, 2, 4, 8, 16, 32, 64] {
        let mutex = TaskMutex::new();
        let flag = AtomicU32::new(0);
        let (locked_tx, locked_rx) = mpsc::channel();

        thread::scope(|s| {
            let mutex = &mutex;
            let flag = &flag;

            s.spawn(move || {
                let mut lock = ScopedLock::writer(mutex);
                locked_tx.send(()).unwrap();
                lock.execute(|scope| {
                    for _ in 0..num_threads {
                        scope.spawn(|_| thread::sleep(Duration::from_micros(500)));
                    }
                    thread::sleep(Duration::from_millis(2));
                    flag.store(1, Ordering::SeqCst);
                });
            });

            locked_rx.recv().unwrap();
            thread::sleep(Duration::from_millis(1));

            for _ in 1..num_threads {
                s.spawn(move || {
                    let lock = ScopedLock::new(mutex, false, true);
                    assert!(lock.is_locked());
                    assert!(!lock.recursive());
                    // The writer released the lock before we got it.
                    assert_eq!(flag.load(Ordering::SeqCst), 1);
                });
            }
        });

        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn lazy_init_from_many_threads() {
    init_logger();

    for num_threads in [1, 3, 16, 64] {
        let cell: TaskOnceCell<Vec<u32>> = TaskOnceCell::new();
        let inits = AtomicU32::new(0);
        let filled = AtomicU32::new(0);

        thread::scope(|s| {
            for _ in 0..num_threads {
                s.spawn(|| {
                    let values = cell.get_or_init(|scope| {
                        inits.fetch_add(1, Ordering::SeqCst);
                        for _ in 0..16 {
                            scope.spawn(|_| { filled.fetch_add(16, Ordering::SeqCst); });
                        }
                        vec![1; 256]
                    });
                    assert_eq!(values.len(), 256);
                });
            }
        });

        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(filled.load(Ordering::SeqCst), 256);
    }
}

#[test]
fn lazy_init_inside_thread_pool() {
    init_logger();

    let pool = ThreadPool::builder().with_worker_threads(3).build().unwrap();
    let cell: &'static TaskOnceCell<u32> = Box::leak(Box::new(TaskOnceCell::new()));
    let jobs: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(0)));
    let (tx, rx) = mpsc::channel();

    for _ in 0..12 {
        let tx = tx.clone();
        pool.spawn(move || {
            let value = cell.get_or_init(|scope| {
                for _ in 0..64 {
                    scope.spawn(move |_| {
                        jobs.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(100));
                    });
                }
                5
            });
            tx.send(*value).unwrap();
        });
    }
    drop(tx);

    let values: Vec<u32> = rx.iter().collect();
    assert_eq!(values, vec![5; 12]);
    assert_eq!(jobs.load(Ordering::SeqCst), 64);

    pool.shut_down().wait();
}
