use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

// The state is a single word:
// - bit 0 marks an exclusive (write) lock,
// - bit 1 marks a writer waiting for readers to leave, which keeps new readers out,
// - the remaining bits count readers.
const WRITER: usize = 1;
const WRITER_PENDING: usize = 2;
const READERS: usize = !(WRITER | WRITER_PENDING);
const ONE_READER: usize = 4;
const BUSY: usize = WRITER | READERS;

/// A spinning, non-recursive reader-writer lock.
///
/// There are no guards: the caller is responsible for pairing each successful
/// `lock`/`try_lock`/`upgrade` with `unlock`, and each successful
/// `lock_shared`/`try_lock_shared` with `unlock_shared`. `ScopedLock` does this
/// bookkeeping for `TaskMutex`.
///
/// Writers that are waiting set a pending flag that stops new readers from
/// getting in, so a steady stream of readers can't starve them. There is no FIFO
/// fairness otherwise.
pub struct RwLock {
    state: AtomicUsize,
}

impl RwLock {
    pub const fn new() -> Self {
        RwLock {
            state: AtomicUsize::new(0),
        }
    }

    /// Acquire an exclusive lock, spinning until it is available.
    pub fn lock(&self) {
        let backoff = Backoff::new();
        loop {
            let s = self.state.load(Ordering::Relaxed);
            if s & BUSY == 0 {
                // This also clears the pending flag, which other waiting writers will set again.
                if self.state.compare_exchange(s, WRITER, Ordering::Acquire, Ordering::Relaxed).is_ok() {
                    return;
                }
                backoff.reset();
            } else if s & WRITER_PENDING == 0 {
                self.state.fetch_or(WRITER_PENDING, Ordering::Relaxed);
            }
            backoff.snooze();
        }
    }

    /// Attempt to acquire an exclusive lock without blocking.
    pub fn try_lock(&self) -> bool {
        let s = self.state.load(Ordering::Relaxed);
        if s & BUSY != 0 {
            return false;
        }

        self.state.compare_exchange(s, WRITER, Ordering::Acquire, Ordering::Relaxed).is_ok()
    }

    pub fn unlock(&self) {
        debug_assert!(self.state.load(Ordering::Relaxed) & WRITER != 0, "unlock() without a writer lock");
        self.state.fetch_and(READERS, Ordering::Release);
    }

    /// Acquire a shared lock, spinning until no writer holds or waits for the lock.
    pub fn lock_shared(&self) {
        let backoff = Backoff::new();
        while !self.try_lock_shared() {
            backoff.snooze();
        }
    }

    /// Attempt to acquire a shared lock without blocking.
    pub fn try_lock_shared(&self) -> bool {
        let s = self.state.load(Ordering::Relaxed);
        if s & (WRITER | WRITER_PENDING) != 0 {
            return false;
        }

        let prev = self.state.fetch_add(ONE_READER, Ordering::Acquire);
        if prev & WRITER == 0 {
            return true;
        }

        // A writer got in between the load and the increment.
        self.state.fetch_sub(ONE_READER, Ordering::Release);

        false
    }

    pub fn unlock_shared(&self) {
        debug_assert!(self.state.load(Ordering::Relaxed) & READERS != 0, "unlock_shared() without a reader lock");
        self.state.fetch_sub(ONE_READER, Ordering::Release);
    }

    /// Turn a shared lock held by the caller into an exclusive one.
    ///
    /// Returns true if the lock was never released in the process. Returns false
    /// if the shared lock had to be dropped before acquiring the exclusive one, in
    /// which case another writer may have held the lock in between and anything
    /// observed under the shared lock must be checked again.
    pub fn upgrade(&self) -> bool {
        let mut s = self.state.load(Ordering::Relaxed);
        debug_assert!(s & READERS != 0, "upgrade() without a reader lock");

        // We may only flag ourselves as the upgrading writer if no other writer is
        // pending, or if we are the only reader (then the pending writer can't be
        // another upgrade).
        while (s & READERS) == ONE_READER || s & WRITER_PENDING == 0 {
            match self.state.compare_exchange(
                s,
                s | WRITER | WRITER_PENDING,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let backoff = Backoff::new();
                    while self.state.load(Ordering::Acquire) & READERS != ONE_READER {
                        backoff.snooze();
                    }

                    // New readers and writers are both kept out at this point.
                    self.state.fetch_sub(ONE_READER + WRITER_PENDING, Ordering::AcqRel);

                    return true;
                }
                Err(current) => {
                    s = current;
                }
            }
        }

        // Someone else is upgrading, let them through.
        self.unlock_shared();
        self.lock();

        false
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & BUSY != 0
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = self.state.load(Ordering::Relaxed);
        f.debug_struct("RwLock")
            .field("writer", &(s & WRITER != 0))
            .field("writer_pending", &(s & WRITER_PENDING != 0))
            .field("readers", &((s & READERS) / ONE_READER))
            .finish()
    }
}

#[test]
fn exclusive_blocks_everyone() {
    let lock = RwLock::new();

    assert!(lock.try_lock());
    assert!(lock.is_locked_exclusive());
    assert!(!lock.try_lock());
    assert!(!lock.try_lock_shared());

    lock.unlock();
    assert!(!lock.is_locked());
    assert!(lock.try_lock_shared());
    lock.unlock_shared();
}

#[test]
fn shared_reading() {
    let lock = RwLock::new();

    assert!(lock.try_lock_shared());
    assert!(lock.try_lock_shared());
    lock.lock_shared();

    assert!(lock.is_locked());
    assert!(!lock.is_locked_exclusive());
    assert!(!lock.try_lock());

    lock.unlock_shared();
    lock.unlock_shared();
    assert!(!lock.try_lock());
    lock.unlock_shared();

    assert!(lock.try_lock());
    lock.unlock();
}

#[test]
fn single_reader_upgrades_in_place() {
    let lock = RwLock::new();

    lock.lock_shared();
    assert!(lock.upgrade());
    assert!(lock.is_locked_exclusive());
    assert!(!lock.try_lock_shared());

    lock.unlock();
    assert!(!lock.is_locked());
}

#[test]
fn pending_writer_keeps_readers_out() {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    let lock = Arc::new(RwLock::new());
    let acquired = Arc::new(AtomicBool::new(false));

    lock.lock_shared();

    let l2 = lock.clone();
    let a2 = acquired.clone();
    let writer = std::thread::spawn(move || {
        l2.lock();
        a2.store(true, Ordering::SeqCst);
        l2.unlock();
    });

    // Wait until the writer announced itself.
    while lock.state.load(Ordering::SeqCst) & WRITER_PENDING == 0 {
        std::thread::yield_now();
    }

    assert!(!lock.try_lock_shared());
    assert!(!acquired.load(Ordering::SeqCst));

    lock.unlock_shared();
    writer.join().unwrap();

    assert!(acquired.load(Ordering::SeqCst));
    assert!(!lock.is_locked());
}

#[test]
fn writers_are_exclusive() {
    use crate::ExclusiveCheck;
    use std::sync::Arc;

    let lock = Arc::new(RwLock::new());
    let check = Arc::new(ExclusiveCheck::with_tag("rw_lock"));

    let threads: Vec<_> = (0..8).map(|_| {
        let lock = lock.clone();
        let check = check.clone();
        std::thread::spawn(move || {
            for _ in 0..1000 {
                lock.lock();
                check.begin();
                check.end();
                lock.unlock();
            }
        })
    }).collect();

    for thread in threads {
        thread.join().unwrap();
    }
}
