use super::{WaitQueue, should_check_on_drop};
use crate::thread::{self, ThreadStatus};
use crossbeam_utils::atomic::AtomicCell;
use machine::interrupt::InterruptGuard;

/// A mutual exclusion lock.
///
/// At most one thread holds a lock at a time, and only the holder may release
/// it. Unlike [`SpinLock`], a contended [`Lock::acquire`] puts the caller to
/// sleep.
///
/// Releasing wakes the most urgent waiter but does not hand the lock over:
/// the woken thread competes for the lock again when it runs.
///
/// # Panics
/// - Acquiring a lock the caller already holds.
/// - Releasing a lock the caller does not hold.
/// - Dropping a lock that is held or has waiters.
///
/// [`SpinLock`]: machine::spinlock::SpinLock
pub struct Lock {
    name: String,
    owner: AtomicCell<Option<u64>>,
    waiters: WaitQueue,
}

impl Lock {
    /// Create a free lock.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: AtomicCell::new(None),
            waiters: WaitQueue::new(),
        }
    }

    /// The name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until the lock is free, then take it.
    pub fn acquire(&self) {
        let guard = InterruptGuard::new();
        let current = thread::current();
        assert_ne!(
            self.owner.load(),
            Some(current.tid),
            "Lock `{}` acquired twice by `{}`.",
            self.name,
            current.name()
        );
        while self.owner.load().is_some() {
            current.set_status(ThreadStatus::Blocked);
            self.waiters.push(current.clone());
            thread::sleep(&guard);
        }
        self.owner.store(Some(current.tid));
    }

    /// Give the lock up and wake the most urgent waiter.
    pub fn release(&self) {
        let _guard = InterruptGuard::new();
        assert!(
            self.is_held_by_current_thread(),
            "Lock `{}` released by `{}`, which does not hold it.",
            self.name,
            thread::current().name()
        );
        if let Some(th) = self.waiters.pop() {
            thread::ready_to_run(th);
        }
        self.owner.store(None);
    }

    /// Returns true if the calling thread holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load() == Some(thread::current().tid)
    }

    /// Returns true if some thread holds the lock.
    pub fn is_held(&self) -> bool {
        self.owner.load().is_some()
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if should_check_on_drop() {
            assert!(
                self.owner.load().is_none(),
                "Lock `{}` destroyed while held.",
                self.name
            );
            assert!(
                self.waiters.is_empty(),
                "Lock `{}` destroyed while {} thread(s) wait on it.",
                self.name,
                self.waiters.len()
            );
        }
    }
}
