use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use smallvec::SmallVec;

use crate::arena::ArenaObserver;

/// Tracks which threads are currently executing inside an arena.
///
/// Register it with `Arena::observe` before any thread enters the arena. Threads
/// doing nested work on behalf of the arena can then be told apart from unrelated
/// threads, which is what lets `TaskMutex` hand out recursive locks.
pub struct ResidencyTracker {
    // Rarely more than one entry per core, so a linear scan is fine.
    residents: Mutex<SmallVec<[ThreadId; 16]>>,
}

impl ResidencyTracker {
    pub fn new() -> Self {
        ResidencyTracker {
            residents: Mutex::new(SmallVec::new()),
        }
    }

    pub fn enter(&self, thread: ThreadId) {
        let mut residents = self.lock();
        debug_assert!(!residents.contains(&thread), "{:?} entered the arena twice", thread);
        residents.push(thread);
    }

    pub fn exit(&self, thread: ThreadId) {
        let mut residents = self.lock();
        let idx = residents.iter().position(|resident| *resident == thread);
        debug_assert!(idx.is_some(), "{:?} left an arena it wasn't in", thread);
        if let Some(idx) = idx {
            residents.swap_remove(idx);
        }
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.lock().contains(&thread)
    }

    pub fn contains_current_thread(&self) -> bool {
        self.contains(thread::current().id())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<SmallVec<[ThreadId; 16]>> {
        // The set is never left half-updated, so a poisoned lock is still usable.
        self.residents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ResidencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaObserver for ResidencyTracker {
    fn on_entry(&self, thread: ThreadId) {
        self.enter(thread);
    }

    fn on_exit(&self, thread: ThreadId) {
        self.exit(thread);
    }
}

#[test]
fn enter_exit() {
    let tracker = ResidencyTracker::new();
    let me = thread::current().id();
    let other = thread::spawn(|| thread::current().id()).join().unwrap();

    assert!(tracker.is_empty());
    assert!(!tracker.contains_current_thread());

    tracker.enter(me);
    tracker.enter(other);
    assert!(tracker.contains_current_thread());
    assert!(tracker.contains(other));
    assert_eq!(tracker.len(), 2);

    tracker.exit(me);
    assert!(!tracker.contains(me));
    assert!(tracker.contains(other));

    tracker.exit(other);
    assert!(tracker.is_empty());
}

#[test]
#[cfg(debug_assertions)]
#[should_panic]
fn double_entry() {
    let tracker = ResidencyTracker::new();
    tracker.enter(thread::current().id());
    tracker.enter(thread::current().id());
}

#[test]
#[cfg(debug_assertions)]
#[should_panic]
fn exit_without_entry() {
    let tracker = ResidencyTracker::new();
    tracker.exit(thread::current().id());
}
