use super::{Lock, WaitQueue, should_check_on_drop};
use crate::thread::{self, ThreadStatus};
use machine::interrupt::InterruptGuard;

/// A condition variable with Mesa semantics.
///
/// A condition has no state of its own: it is a queue of threads waiting for
/// some predicate over data protected by a [`Lock`]. Every operation takes
/// that lock, which the caller must hold.
///
/// A signaled waiter is only made ready. By the time it re-acquires the lock
/// the predicate may be false again, so waits belong in a loop:
///
/// ```rust,ignore
/// lock.acquire();
/// while !predicate() {
///     cond.wait(&lock);
/// }
/// ```
pub struct Condition {
    name: String,
    waiters: WaitQueue,
}

impl Condition {
    /// Create a condition with no waiters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            waiters: WaitQueue::new(),
        }
    }

    /// The name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn assert_held(&self, lock: &Lock) {
        assert!(
            lock.is_held_by_current_thread(),
            "Condition `{}` used without holding lock `{}`.",
            self.name,
            lock.name()
        );
    }

    /// Release `lock`, sleep until signaled, then re-acquire `lock`.
    ///
    /// Releasing and going to sleep happen atomically: a signal sent right
    /// after the release is not lost.
    pub fn wait(&self, lock: &Lock) {
        let guard = InterruptGuard::new();
        self.assert_held(lock);
        lock.release();
        let current = thread::current();
        current.set_status(ThreadStatus::Blocked);
        self.waiters.push(current);
        thread::sleep(&guard);
        drop(guard);
        lock.acquire();
    }

    /// Wake the most urgent waiter, if any.
    pub fn signal(&self, lock: &Lock) {
        let _guard = InterruptGuard::new();
        self.assert_held(lock);
        if let Some(th) = self.waiters.pop() {
            thread::ready_to_run(th);
        }
    }

    /// Wake every waiter, most urgent first.
    pub fn broadcast(&self, lock: &Lock) {
        let _guard = InterruptGuard::new();
        self.assert_held(lock);
        while let Some(th) = self.waiters.pop() {
            thread::ready_to_run(th);
        }
    }

    /// Number of waiters.
    pub fn waiters(&self) -> usize {
        self.waiters.len()
    }
}

impl Drop for Condition {
    fn drop(&mut self) {
        if should_check_on_drop() {
            assert!(
                self.waiters.is_empty(),
                "Condition `{}` destroyed while {} thread(s) wait on it.",
                self.name,
                self.waiters.len()
            );
        }
    }
}
