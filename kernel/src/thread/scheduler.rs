//! Thread scheduler

use super::{Thread, ThreadStatus, current, reap};
use crate::sync::WaitQueue;
use machine::{context, interrupt::InterruptGuard, spinlock::SpinLock};
use std::{collections::VecDeque, sync::Arc};

/// A trait for a thread scheduler.
///
/// The [`Scheduler`] trait defines the common functionality expected from a
/// thread scheduler. It provides an interface for managing the threads that
/// are ready to run and for determining which thread to run next. The
/// scheduler determines when each thread is allowed to run; switching to the
/// chosen thread is done by [`run`], which is shared by every
/// implementation.
///
/// Every method is called with interrupts disabled.
///
/// [`run`]: #method.run
pub trait Scheduler: Send + Sync {
    /// Peek a next thread to run.
    ///
    /// This method checks the queue and returns the next thread to run. If no
    /// threads are available, it returns `None`.
    fn next_to_run(&self) -> Option<Arc<Thread>>;

    /// Push a thread `th` into scheduling queue.
    ///
    /// This method adds the specified thread to the queue of threads waiting to
    /// be scheduled.
    fn push_to_queue(&self, th: Arc<Thread>);

    /// Returns true if some thread is ready to run.
    fn has_ready(&self) -> bool;
}

impl dyn Scheduler {
    /// Switch the CPU from the running thread to `next`.
    ///
    /// Returns when the running thread is scheduled again. The caller must
    /// have put the running thread where it will be found again, or marked
    /// it finishing.
    pub fn run(&self, next: Arc<Thread>) {
        debug_assert!(InterruptGuard::is_guarded());
        next.set_status(ThreadStatus::Running);
        if Arc::ptr_eq(&next, &current()) {
            return;
        }
        let Some(context) = next.context.get() else {
            panic!("Thread `{}` scheduled without an execution context.", next.name());
        };
        context.resume();
        context::suspend();
        reap();
    }
}

/// Highest priority first, and first come first served among equals.
pub struct PriorityScheduler {
    runqueue: WaitQueue,
}

impl PriorityScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self {
            runqueue: WaitQueue::new(),
        }
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for PriorityScheduler {
    fn next_to_run(&self) -> Option<Arc<Thread>> {
        self.runqueue.pop()
    }
    fn push_to_queue(&self, th: Arc<Thread>) {
        self.runqueue.push(th)
    }
    fn has_ready(&self) -> bool {
        !self.runqueue.is_empty()
    }
}

/// A First-in-first-out scheduler.
pub struct Fifo {
    runqueue: SpinLock<VecDeque<Arc<Thread>>>,
}

impl Fifo {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self {
            runqueue: SpinLock::new(VecDeque::new()),
        }
    }
}

impl Default for Fifo {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for Fifo {
    fn next_to_run(&self) -> Option<Arc<Thread>> {
        let mut guard = self.runqueue.lock();
        let val = guard.pop_front();
        guard.unlock();
        val
    }
    fn push_to_queue(&self, th: Arc<Thread>) {
        let mut guard = self.runqueue.lock();
        guard.push_back(th);
        guard.unlock();
    }
    fn has_ready(&self) -> bool {
        let guard = self.runqueue.lock();
        let val = !guard.is_empty();
        guard.unlock();
        val
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_ignores_priority() {
        let fifo = Fifo::new();
        let low = Thread::new("low", 0, false, None);
        let high = Thread::new("high", 9, false, None);
        fifo.push_to_queue(low.clone());
        fifo.push_to_queue(high.clone());
        assert!(fifo.has_ready());
        assert_eq!(fifo.next_to_run().map(|th| th.tid), Some(low.tid));
        assert_eq!(fifo.next_to_run().map(|th| th.tid), Some(high.tid));
        assert!(!fifo.has_ready());
    }

    #[test]
    fn priority_scheduler_prefers_urgent_threads() {
        let sched = PriorityScheduler::new();
        let low = Thread::new("low", 0, false, None);
        let high = Thread::new("high", 9, false, None);
        sched.push_to_queue(low.clone());
        sched.push_to_queue(high.clone());
        assert_eq!(sched.next_to_run().map(|th| th.tid), Some(high.tid));
        assert_eq!(sched.next_to_run().map(|th| th.tid), Some(low.tid));
        assert!(sched.next_to_run().is_none());
    }
}
