use super::{WaitQueue, should_check_on_drop};
use crate::thread::{self, ThreadStatus};
use machine::interrupt::InterruptGuard;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A counting semaphore.
///
/// The value is never negative. [`Semaphore::p`] waits until the value is
/// positive and then decrements it; [`Semaphore::v`] increments it and wakes
/// one waiter. Both are atomic with respect to every other kernel thread and
/// to interrupt handlers, so a semaphore may be signaled from an interrupt
/// handler.
///
/// # Example
///
/// ```rust
/// use kernel::{Kernel, SystemConfigurationBuilder, sync::Semaphore, thread::ThreadBuilder};
/// use std::sync::Arc;
///
/// let kernel = Kernel::boot(SystemConfigurationBuilder::new().set_quiet(true).build());
/// kernel.run(|| {
///     let ping = Arc::new(Semaphore::new("ping", 0));
///     let p = ping.clone();
///     ThreadBuilder::new("ponger").spawn(move || p.v()).unwrap();
///     ping.p();
///     assert_eq!(ping.value(), 0);
/// });
/// ```
pub struct Semaphore {
    name: String,
    value: AtomicUsize,
    waiters: WaitQueue,
}

impl Semaphore {
    /// Create a semaphore with the initial value `value`.
    pub fn new(name: impl Into<String>, value: usize) -> Self {
        Self {
            name: name.into(),
            value: AtomicUsize::new(value),
            waiters: WaitQueue::new(),
        }
    }

    /// The name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current value.
    pub fn value(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }

    /// Wait until the value is positive, then decrement it.
    ///
    /// A woken waiter re-checks the value: a thread that runs in between may
    /// have taken it.
    pub fn p(&self) {
        let guard = InterruptGuard::new();
        while self.value.load(Ordering::SeqCst) == 0 {
            let current = thread::current();
            current.set_status(ThreadStatus::Blocked);
            self.waiters.push(current);
            thread::sleep(&guard);
        }
        self.value.fetch_sub(1, Ordering::SeqCst);
    }

    /// Increment the value, waking the most urgent waiter if any.
    pub fn v(&self) {
        let _guard = InterruptGuard::new();
        if let Some(th) = self.waiters.pop() {
            thread::ready_to_run(th);
        }
        self.value.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if should_check_on_drop() {
            assert!(
                self.waiters.is_empty(),
                "Semaphore `{}` destroyed while {} thread(s) wait on it.",
                self.name,
                self.waiters.len()
            );
        }
    }
}
