//! Thread abstraction.
//!
//! ## The threading model
//!
//! An executing kernel consists of a collection of threads, each with their
//! own execution context and local state. Exactly one of them runs at a
//! time; the others are either ready, waiting in the [`Scheduler`], or
//! blocked on a synchronization primitive.
//!
//! A thread goes through the following states:
//!
//! ```text
//! JustCreated --fork--> Ready <--yield/wake-- Running --sleep--> Blocked
//!                                               |
//!                                            finish
//!                                               v
//!                                  Finishing --reap--> Destroyed
//! ```
//!
//! A finishing thread cannot release its own execution context, since it is
//! still running on it. It queues itself for destruction instead, and the
//! next thread that gets the CPU reclaims it.
//!
//! ## Joining
//!
//! A thread created as joinable keeps its control block alive after it
//! finishes until its parent calls [`Thread::join`], which returns the value
//! passed to [`finish`]. The two sides rendezvous on a private lock and
//! condition, so it does not matter which one arrives first.
//!
//! [`Scheduler`]: scheduler::Scheduler
pub mod scheduler;

use crate::{
    Kernel, KernelError,
    process::Process,
    sync::{Condition, Lock},
};
use crossbeam_utils::atomic::AtomicCell;
use machine::{
    context::Context,
    interrupt::{InterruptGuard, InterruptState},
};
use std::{
    cell::RefCell,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering},
    },
};

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadStatus {
    /// Created but not forked yet.
    JustCreated,
    /// Waiting in the ready queue.
    Ready,
    /// Owns the CPU.
    Running,
    /// Waiting on a synchronization primitive.
    Blocked,
    /// Finished, waiting to be reclaimed.
    Finishing,
    /// Execution context reclaimed.
    Destroyed,
}

thread_local! {
    static KERNEL: RefCell<Option<Arc<Kernel>>> = const { RefCell::new(None) };
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

/// Bind the calling execution context to kernel thread `th` of `kernel`.
pub(crate) fn bind(kernel: Arc<Kernel>, th: Arc<Thread>) {
    KERNEL.with(|k| *k.borrow_mut() = Some(kernel));
    CURRENT.with(|c| *c.borrow_mut() = Some(th));
}

/// Forget the binding made by [`bind`].
pub(crate) fn unbind() {
    let _ = CURRENT.try_with(|c| c.borrow_mut().take());
    let _ = KERNEL.try_with(|k| k.borrow_mut().take());
}

/// The kernel the calling thread belongs to.
///
/// # Panics
/// Panics if called outside of a kernel thread.
pub fn kernel() -> Arc<Kernel> {
    try_kernel().unwrap_or_else(|| panic!("kernel() called outside of a kernel thread"))
}

/// The kernel the calling thread belongs to, if any.
pub fn try_kernel() -> Option<Arc<Kernel>> {
    KERNEL.try_with(|k| k.borrow().clone()).ok().flatten()
}

/// The running thread.
///
/// # Panics
/// Panics if called outside of a kernel thread.
pub fn current() -> Arc<Thread> {
    CURRENT
        .try_with(|c| c.borrow().clone())
        .ok()
        .flatten()
        .unwrap_or_else(|| panic!("current() called outside of a kernel thread"))
}

/// An thread abstraction.
pub struct Thread {
    /// Thread id
    pub tid: u64,
    name: String,
    priority: AtomicI32,
    status: AtomicCell<ThreadStatus>,
    joinable: bool,
    forked: AtomicBool,
    joined: AtomicBool,
    ready_to_join: AtomicBool,
    exit_value: AtomicI32,
    join_lock: Lock,
    join_cond: Condition,
    context: OnceLock<Context>,
    process: Option<Arc<Process>>,
}

impl Thread {
    /// Create a thread control block. The thread does not run until it is
    /// [forked](Thread::fork).
    pub fn new(
        name: impl Into<String>,
        priority: i32,
        joinable: bool,
        process: Option<Arc<Process>>,
    ) -> Arc<Self> {
        static TID: AtomicU64 = AtomicU64::new(0);
        let tid = TID.fetch_add(1, Ordering::SeqCst);
        let name = name.into();
        Arc::new(Self {
            join_lock: Lock::new(format!("{name} join lock")),
            join_cond: Condition::new(format!("{name} join condition")),
            tid,
            name,
            priority: AtomicI32::new(priority),
            status: AtomicCell::new(ThreadStatus::JustCreated),
            joinable,
            forked: AtomicBool::new(false),
            joined: AtomicBool::new(false),
            ready_to_join: AtomicBool::new(false),
            exit_value: AtomicI32::new(0),
            context: OnceLock::new(),
            process,
        })
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scheduling priority. Larger is more urgent.
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::SeqCst)
    }

    /// Change the scheduling priority. Queues the thread is already in are
    /// not reordered.
    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::SeqCst);
    }

    /// The state of the thread.
    pub fn status(&self) -> ThreadStatus {
        self.status.load()
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.status.store(status);
    }

    /// Returns true if the thread can be [joined](Thread::join).
    pub fn is_joinable(&self) -> bool {
        self.joinable
    }

    /// The value the thread finished with. Meaningful once it finished.
    pub fn exit_value(&self) -> i32 {
        self.exit_value.load(Ordering::SeqCst)
    }

    /// The user process this thread runs, if any.
    pub fn process(&self) -> Option<&Arc<Process>> {
        self.process.as_ref()
    }

    pub(crate) fn set_context(&self, context: Context) {
        assert!(
            self.context.set(context).is_ok(),
            "Thread `{}` already has an execution context.",
            self.name
        );
    }

    pub(crate) fn destroy_context(&self) {
        if let Some(context) = self.context.get() {
            context.destroy();
        }
    }

    /// Start running `f` on a new execution context.
    ///
    /// The thread becomes ready; it finishes with status 0 when `f`
    /// returns.
    ///
    /// # Panics
    /// Panics if the thread was forked before.
    pub fn fork<F>(self: &Arc<Self>, f: F) -> Result<(), KernelError>
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            !self.forked.load(Ordering::SeqCst),
            "Thread `{}` forked twice.",
            self.name
        );
        let kernel = kernel();
        let (k, th) = (kernel.clone(), self.clone());
        let context = Context::new(&kernel.machine.cpu, &self.name, move || {
            thread_start(k, th, f)
        })?;
        self.set_context(context);
        self.forked.store(true, Ordering::SeqCst);
        kernel.register(self.clone());
        debug!("Thread: `{}` ({}) forked.", self.name, self.tid);

        let _guard = InterruptGuard::new();
        ready_to_run(self.clone());
        Ok(())
    }

    /// Wait until the thread finishes, and return its exit value.
    ///
    /// # Panics
    /// Panics if the thread is not joinable, was never forked, is the
    /// calling thread, or was already joined.
    pub fn join(self: &Arc<Self>) -> i32 {
        assert!(self.joinable, "Thread `{}` is not joinable.", self.name);
        assert_ne!(
            self.tid,
            current().tid,
            "Thread `{}` cannot join itself.",
            self.name
        );
        assert!(
            self.forked.load(Ordering::SeqCst),
            "Thread `{}` joined before it was forked.",
            self.name
        );
        assert!(
            !self.joined.swap(true, Ordering::SeqCst),
            "Thread `{}` joined twice.",
            self.name
        );

        self.join_lock.acquire();
        self.ready_to_join.store(true, Ordering::SeqCst);
        self.join_cond.signal(&self.join_lock);
        self.join_cond.wait(&self.join_lock);
        self.join_cond.signal(&self.join_lock);
        self.join_lock.release();
        self.exit_value()
    }
}

struct Unbind;

impl Drop for Unbind {
    fn drop(&mut self) {
        unbind();
    }
}

fn thread_start<F: FnOnce()>(kernel: Arc<Kernel>, th: Arc<Thread>, f: F) {
    bind(kernel, th);
    let _unbind = Unbind;
    reap();
    InterruptState::enable();
    f();
    finish(0)
}

/// A struct to build a new thread.
pub struct ThreadBuilder {
    name: String,
    priority: i32,
    joinable: bool,
    process: Option<Arc<Process>>,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            joinable: false,
            process: None,
        }
    }

    /// Sets the scheduling priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Make the thread joinable.
    pub fn joinable(mut self, joinable: bool) -> Self {
        self.joinable = joinable;
        self
    }

    /// Attach a user process to the thread.
    pub fn process(mut self, process: Arc<Process>) -> Self {
        self.process = Some(process);
        self
    }

    /// Create the thread without starting it.
    pub fn build(self) -> Arc<Thread> {
        Thread::new(self.name, self.priority, self.joinable, self.process)
    }

    /// Spawn the thread.
    pub fn spawn<F>(self, f: F) -> Result<Arc<Thread>, KernelError>
    where
        F: FnOnce() + Send + 'static,
    {
        let th = self.build();
        th.fork(f)?;
        Ok(th)
    }
}

/// Make `th` ready to run. Interrupts must be disabled.
pub fn ready_to_run(th: Arc<Thread>) {
    debug_assert!(InterruptGuard::is_guarded());
    th.set_status(ThreadStatus::Ready);
    kernel().scheduler.push_to_queue(th);
}

/// Give the CPU to another ready thread, if there is one.
pub fn yield_now() {
    let _guard = InterruptGuard::new();
    let kernel = kernel();
    if let Some(next) = kernel.scheduler.next_to_run() {
        let current = current();
        current.set_status(ThreadStatus::Ready);
        kernel.scheduler.push_to_queue(current);
        kernel.scheduler.run(next);
    }
}

/// Relinquish the CPU until someone makes the calling thread ready again.
///
/// The caller has already marked itself [`Blocked`] and recorded itself
/// where it will be found, all under `_guard`. When no thread is ready, the
/// machine idles until an interrupt readies one.
///
/// # Panics
/// Panics if nothing is ready and no interrupt is pending: no thread could
/// ever run again.
///
/// [`Blocked`]: ThreadStatus::Blocked
pub fn sleep(_guard: &InterruptGuard) {
    let kernel = kernel();
    loop {
        if let Some(next) = kernel.scheduler.next_to_run() {
            kernel.scheduler.run(next);
            return;
        }
        if !kernel.machine.cpu.interrupt.idle() {
            panic!(
                "Deadlock: `{}` sleeps, no thread is ready and no interrupt is pending.",
                current().name()
            );
        }
    }
}

/// Finish the calling thread with `status`.
///
/// A joinable thread first waits for its parent to [join](Thread::join) it.
/// The execution context is reclaimed by the next thread that runs.
pub fn finish(status: i32) -> ! {
    let current = current();
    current.exit_value.store(status, Ordering::SeqCst);
    debug!(
        "Thread: `{}` ({}) finishes with {status}.",
        current.name, current.tid
    );

    current.join_lock.acquire();
    while !current.ready_to_join.load(Ordering::SeqCst) && current.joinable {
        current.join_cond.signal(&current.join_lock);
        current.join_cond.wait(&current.join_lock);
        current.join_cond.signal(&current.join_lock);
    }
    current.join_cond.signal(&current.join_lock);
    if current.joinable {
        current.join_cond.wait(&current.join_lock);
    }
    current.join_lock.release();

    let guard = InterruptGuard::new();
    kernel().destroy_queue.push(current.clone());
    current.set_status(ThreadStatus::Finishing);
    sleep(&guard);
    unreachable!("Thread `{}` ran after it finished.", current.name)
}

/// Reclaim the threads that finished.
pub(crate) fn reap() {
    let Some(kernel) = try_kernel() else {
        return;
    };
    while let Some(th) = kernel.destroy_queue.pop() {
        th.destroy_context();
        th.set_status(ThreadStatus::Destroyed);
        kernel.unregister(th.tid);
        debug!("Thread: `{}` ({}) destroyed.", th.name, th.tid);
    }
}

