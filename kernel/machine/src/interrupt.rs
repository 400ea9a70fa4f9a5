//! Interrupt
//!
//! The simulated CPU has a single interrupt level, either [`On`] or [`Off`].
//! The kernel turns interrupts off to make a sequence of operations atomic
//! with respect to interrupt handlers and to the scheduler, through the
//! [`InterruptGuard`] RAII type.
//!
//! Devices do not interrupt asynchronously. Instead, they schedule an
//! interrupt to happen after some amount of simulated time, and the
//! [`Interrupt`] controller delivers it when the clock passes that point.
//! The clock advances when interrupts are re-enabled (a "system tick"), when
//! user code executes (a "user tick"), and when the CPU idles waiting for
//! the next pending interrupt.
//!
//! [`On`]: InterruptState::On
//! [`Off`]: InterruptState::Off

use crate::{context, spinlock::SpinLock, stats::Statistics};
use std::{
    collections::BTreeMap,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Time advanced when interrupts are re-enabled in kernel code.
pub const SYSTEM_TICK: u64 = 10;
/// Time advanced for each user-mode operation.
pub const USER_TICK: u64 = 1;
/// Latency of a console read or write.
pub const CONSOLE_TIME: u64 = 100;

/// Enumeration representing the interrupt state.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

impl InterruptState {
    /// Reads the current interrupt state of the CPU the calling context runs
    /// on.
    ///
    /// # Returns
    /// - [`InterruptState::On`] if interrupts are enabled, or the caller is
    ///   not bound to a CPU.
    /// - [`InterruptState::Off`] if interrupts are disabled.
    pub fn current() -> Self {
        context::bound_cpu()
            .map(|cpu| cpu.interrupt.level())
            .unwrap_or(Self::On)
    }

    /// Enable interrupts without advancing the clock.
    pub fn enable() {
        if let Some(cpu) = context::bound_cpu() {
            cpu.interrupt.set_level(Self::On);
        }
    }

    /// Disable interrupts.
    pub fn disable() {
        if let Some(cpu) = context::bound_cpu() {
            cpu.interrupt.set_level(Self::Off);
        }
    }
}

/// An RAII-based guard for managing interrupt disabling.
///
/// When an `InterruptGuard` is created, interrupts are disabled. When it is
/// dropped, the interrupt state is restored to what it was before the guard
/// was created. Guards therefore nest: only the outermost guard turns
/// interrupts back on.
///
/// A guard may be held across a context switch. The thread switched to
/// resumes inside its own critical section, and restores its own saved
/// state when its guard is dropped.
///
/// **Important:**
/// - [`InterruptGuard`] instances **must be dropped in reverse order of their
///   creation** to prevent unintended interrupt state changes.
pub struct InterruptGuard {
    saved: Option<InterruptState>,
    _not_send: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Creates a new `InterruptGuard`, disabling interrupts.
    ///
    /// # Example
    /// ```rust
    /// use machine::interrupt::InterruptGuard;
    ///
    /// let _guard = InterruptGuard::new(); // Disables interrupts
    /// // Critical section...
    /// // Interrupts are restored when `_guard` goes out of scope.
    /// ```
    pub fn new() -> Self {
        let saved = context::bound_cpu().map(|cpu| cpu.interrupt.set_level(InterruptState::Off));
        Self {
            saved,
            _not_send: PhantomData,
        }
    }

    /// Returns true if interrupts are currently disabled.
    pub fn is_guarded() -> bool {
        InterruptState::current() == InterruptState::Off
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        // A destroyed context no longer owns the CPU.
        if context::is_detached() {
            return;
        }
        if let (Some(saved), Some(cpu)) = (self.saved, context::bound_cpu()) {
            cpu.interrupt.restore(saved);
        }
    }
}

/// The device that raised a pending interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// A character is available on the console.
    ConsoleRead,
    /// The console finished printing a character.
    ConsoleWrite,
}

/// Who is consuming simulated time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickMode {
    /// Kernel code.
    System,
    /// User code.
    User,
}

type Handler = Box<dyn FnOnce() + Send>;

struct Pending {
    queue: BTreeMap<(u64, u64), (InterruptKind, Handler)>,
    seq: u64,
    slice: u64,
}

/// The interrupt controller of the CPU.
pub struct Interrupt {
    enabled: AtomicBool,
    pending: SpinLock<Pending>,
    time_slice: Option<u64>,
    stats: Arc<Statistics>,
}

impl Interrupt {
    pub(crate) fn new(stats: Arc<Statistics>, time_slice: Option<u64>) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            pending: SpinLock::new(Pending {
                queue: BTreeMap::new(),
                seq: 0,
                slice: 0,
            }),
            time_slice,
            stats,
        }
    }

    /// The current interrupt level.
    pub fn level(&self) -> InterruptState {
        if self.enabled.load(Ordering::SeqCst) {
            InterruptState::On
        } else {
            InterruptState::Off
        }
    }

    /// Change the interrupt level, returning the previous one.
    pub fn set_level(&self, state: InterruptState) -> InterruptState {
        let prev = self
            .enabled
            .swap(state == InterruptState::On, Ordering::SeqCst);
        if prev {
            InterruptState::On
        } else {
            InterruptState::Off
        }
    }

    /// Restore a saved level. Turning interrupts back on advances the clock
    /// and delivers whatever became due.
    pub(crate) fn restore(&self, state: InterruptState) {
        let prev = self.set_level(state);
        if prev == InterruptState::Off && state == InterruptState::On {
            self.one_tick(TickMode::System);
        }
    }

    /// The current simulated time.
    pub fn now(&self) -> u64 {
        self.stats.total_ticks.load(Ordering::SeqCst)
    }

    /// Arrange for `handler` to run `after` ticks from now.
    pub fn schedule(
        &self,
        after: u64,
        kind: InterruptKind,
        handler: impl FnOnce() + Send + 'static,
    ) {
        let when = self.now() + after;
        let mut pending = self.pending.lock();
        let seq = pending.seq;
        pending.seq += 1;
        pending.queue.insert((when, seq), (kind, Box::new(handler)));
        pending.unlock();
    }

    /// Returns true if some interrupt is scheduled.
    pub fn has_pending(&self) -> bool {
        let pending = self.pending.lock();
        let result = !pending.queue.is_empty();
        pending.unlock();
        result
    }

    /// Advance the clock by one tick of `mode` and deliver the interrupts
    /// that became due.
    ///
    /// # Returns
    /// `true` if the time slice of the running user code has expired and the
    /// kernel should yield the CPU.
    pub fn one_tick(&self, mode: TickMode) -> bool {
        let (delta, counter) = match mode {
            TickMode::System => (SYSTEM_TICK, &self.stats.system_ticks),
            TickMode::User => (USER_TICK, &self.stats.user_ticks),
        };
        self.stats.total_ticks.fetch_add(delta, Ordering::SeqCst);
        counter.fetch_add(delta, Ordering::SeqCst);
        self.fire_due();

        match (mode, self.time_slice) {
            (TickMode::User, Some(slice)) => {
                let mut pending = self.pending.lock();
                pending.slice += delta;
                let expired = pending.slice >= slice;
                if expired {
                    pending.slice = 0;
                }
                pending.unlock();
                expired
            }
            _ => false,
        }
    }

    /// Nothing is ready to run: advance the clock to the next pending
    /// interrupt and deliver it.
    ///
    /// # Returns
    /// `false` if no interrupt is pending, i.e. nothing will ever happen.
    pub fn idle(&self) -> bool {
        let pending = self.pending.lock();
        let next = pending.queue.keys().next().map(|&(when, _)| when);
        pending.unlock();

        let Some(when) = next else {
            return false;
        };
        let now = self.now();
        if when > now {
            self.stats
                .total_ticks
                .fetch_add(when - now, Ordering::SeqCst);
            self.stats
                .idle_ticks
                .fetch_add(when - now, Ordering::SeqCst);
        }
        self.fire_due();
        true
    }

    fn fire_due(&self) {
        let prev = self.set_level(InterruptState::Off);
        loop {
            let now = self.now();
            let mut pending = self.pending.lock();
            let due = match pending.queue.first_key_value() {
                Some((&key, _)) if key.0 <= now => Some(key),
                _ => None,
            };
            let entry = due.and_then(|key| pending.queue.remove(&key));
            pending.unlock();

            match entry {
                Some((kind, handler)) => {
                    crate::debug!("Interrupt: {kind:?} delivered at tick {now}.");
                    handler();
                }
                None => break,
            }
        }
        self.set_level(prev);
    }
}
