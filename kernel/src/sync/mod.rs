//! Synchronization primitives.
//!
//! Every primitive in this module is built on a single atomicity mechanism:
//! [`InterruptGuard`]. The machine has one CPU and the kernel is never
//! preempted, so a sequence of operations performed with interrupts masked
//! cannot interleave with another thread or with an interrupt handler.
//!
//! A thread that has to wait puts itself on a [`WaitQueue`], marks itself
//! [`Blocked`] and calls [`thread::sleep`]. Whoever makes progress possible
//! takes a thread off the queue and makes it ready with
//! [`thread::ready_to_run`]. Wait queues are ordered by priority: the most
//! urgent waiter is always woken first, and waiters of equal priority are
//! woken in arrival order.
//!
//! - [`Semaphore`]: a counter with atomic [`p`] and [`v`].
//! - [`Lock`]: mutual exclusion with an owner.
//! - [`Condition`]: Mesa-style condition variables used together with a
//!   [`Lock`].
//! - [`Mailbox`]: a rendezvous that hands one integer from a sender to a
//!   receiver.
//!
//! [`InterruptGuard`]: machine::interrupt::InterruptGuard
//! [`Blocked`]: crate::thread::ThreadStatus::Blocked
//! [`thread::sleep`]: crate::thread::sleep
//! [`thread::ready_to_run`]: crate::thread::ready_to_run
//! [`p`]: Semaphore::p
//! [`v`]: Semaphore::v

mod condition;
mod lock;
mod mailbox;
mod semaphore;
mod wait_queue;

pub use condition::Condition;
pub use lock::Lock;
pub use mailbox::Mailbox;
pub use semaphore::Semaphore;
pub use wait_queue::WaitQueue;

/// Returns true when destroying a primitive should validate its state.
///
/// A primitive may legitimately be dropped with waiters when the kernel is
/// shutting down, or while the stack of a destroyed thread unwinds.
pub(crate) fn should_check_on_drop() -> bool {
    !std::thread::panicking()
        && !machine::context::is_detached()
        && crate::thread::try_kernel().is_some_and(|k| k.is_running())
}
