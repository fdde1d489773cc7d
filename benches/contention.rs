#[macro_use]
extern crate criterion;

use std::sync::atomic::{AtomicU32, Ordering};

use criterion::{BenchmarkId, Criterion};

use task_mutex::{ScopedLock, TaskMutex, TaskOnceCell, ThreadPool};

fn uncontended(c: &mut Criterion) {
    let mutex = TaskMutex::new();
    let mut g = c.benchmark_group("uncontended");

    g.bench_function("writer", |b| {
        b.iter(|| {
            let lock = ScopedLock::writer(&mutex);
            std::hint::black_box(&lock);
        })
    });
    g.bench_function("reader", |b| {
        b.iter(|| {
            let lock = ScopedLock::new(&mutex, false, true);
            std::hint::black_box(&lock);
        })
    });
    g.bench_function("reader+upgrade", |b| {
        b.iter(|| {
            let mut lock = ScopedLock::new(&mutex, false, true);
            std::hint::black_box(lock.upgrade_to_writer());
        })
    });
    g.bench_function("execute", |b| {
        let mut lock = ScopedLock::writer(&mutex);
        b.iter(|| lock.execute(|_| std::hint::black_box(1)))
    });

    g.finish();
}

fn contended_init(c: &mut Criterion) {
    let pool = ThreadPool::builder().with_worker_threads(4).build().unwrap();
    let mut g = c.benchmark_group("contended init");

    for num_threads in [1, 2, 4, 8] {
        g.bench_with_input(BenchmarkId::new("threads", num_threads), &num_threads, |b, num_threads| {
            b.iter(|| {
                let cell: TaskOnceCell<u32> = TaskOnceCell::new();
                let sum = AtomicU32::new(0);
                std::thread::scope(|s| {
                    for _ in 0..*num_threads {
                        s.spawn(|| {
                            cell.get_or_init(|scope| {
                                for i in 0..256u32 {
                                    let sum = &sum;
                                    scope.spawn(move |_| {
                                        let mut x = i;
                                        for _ in 0..1000 {
                                            x = std::hint::black_box(x.wrapping_mul(31).wrapping_add(7));
                                        }
                                        sum.fetch_add(x & 1, Ordering::Relaxed);
                                    });
                                }
                                1
                            });
                        });
                    }
                });
                std::hint::black_box(sum.load(Ordering::Relaxed));
            })
        });
    }

    g.finish();

    let mutex = TaskMutex::with_thread_pool(pool.clone());
    c.bench_function("execute with thread pool", |b| {
        let sum = AtomicU32::new(0);
        b.iter(|| {
            let mut lock = ScopedLock::writer(&mutex);
            lock.execute(|scope| {
                for _ in 0..64 {
                    scope.spawn(|_| { sum.fetch_add(1, Ordering::Relaxed); });
                }
            });
        })
    });

    pool.shut_down().wait();
}

criterion_group!(locks, uncontended, contended_init);
criterion_main!(locks);
