//! The single logical CPU of the machine.
//!
//! The CPU is owned by exactly one execution context at a time, identified
//! by [`Cpu::running`]. Handing the CPU over is the job of
//! [`Context::resume`] and [`suspend`].
//!
//! [`Context::resume`]: crate::context::Context::resume
//! [`suspend`]: crate::context::suspend

use crate::{interrupt::Interrupt, spinlock::SpinLock, stats::Statistics};
use crossbeam_utils::sync::Unparker;
use std::{
    any::Any,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

/// Payload of a panic that brought the machine down.
pub type HaltPayload = Box<dyn Any + Send>;

/// A single-core CPU.
pub struct Cpu {
    /// The interrupt controller.
    pub interrupt: Interrupt,
    running: AtomicU64,
    next_id: AtomicU64,
    halted: AtomicBool,
    halt_payload: SpinLock<Option<HaltPayload>>,
    bootstrap: SpinLock<Option<Unparker>>,
}

impl Cpu {
    /// Create a CPU. Interrupts start disabled, as on reset.
    pub fn new(stats: Arc<Statistics>, time_slice: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            interrupt: Interrupt::new(stats, time_slice),
            running: AtomicU64::new(u64::MAX),
            next_id: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            halt_payload: SpinLock::new(None),
            bootstrap: SpinLock::new(None),
        })
    }

    /// Identifier of the execution context that owns the CPU.
    pub fn running(&self) -> u64 {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, id: u64) {
        self.running.store(id, Ordering::SeqCst);
    }

    pub(crate) fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn register_bootstrap(&self, unparker: Unparker) {
        let mut guard = self.bootstrap.lock();
        *guard = Some(unparker);
        guard.unlock();
    }

    /// Returns true once a context panicked.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stop the machine because an execution context panicked.
    ///
    /// The payload is re-raised on the bootstrap context, which is parked
    /// while any other context runs.
    pub fn halt(&self, payload: HaltPayload) {
        let mut guard = self.halt_payload.lock();
        if guard.is_none() {
            *guard = Some(payload);
        }
        guard.unlock();
        self.halted.store(true, Ordering::SeqCst);

        let bootstrap = self.bootstrap.lock();
        if let Some(unparker) = bootstrap.as_ref() {
            unparker.unpark();
        }
        bootstrap.unlock();
    }

    pub(crate) fn take_halt_payload(&self) -> Option<HaltPayload> {
        let mut guard = self.halt_payload.lock();
        let payload = guard.take();
        guard.unlock();
        payload
    }
}
