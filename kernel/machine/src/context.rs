//! Execution contexts.
//!
//! An execution context is a stack bound to an entry point. Each context is
//! backed by a host thread, but only the context that owns the [`Cpu`] may
//! execute: every other context is parked inside [`suspend`]. Switching from
//! one context to another is therefore two steps, performed by the context
//! that currently owns the CPU:
//!
//! ```text
//! next.resume();   // hand the CPU over
//! suspend();       // park until someone hands it back
//! ```
//!
//! A context that will never run again is released with
//! [`Context::destroy`]. Its host thread unwinds out of [`suspend`] silently
//! and exits; destructors that run during that unwinding must not touch the
//! machine (see [`is_detached`]).
//!
//! If the code running on a context panics, the machine halts and the panic
//! is re-raised on the bootstrap context, i.e. the host thread that booted
//! the machine.

use crate::cpu::Cpu;
use crossbeam_utils::sync::{Parker, Unparker};
use std::{
    cell::{Cell, RefCell},
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Size of each context's stack.
pub const STACK_SIZE: usize = 0x100000;

/// Unwinding payload of a destroyed context.
struct Destroyed;

#[derive(Default)]
struct ContextState {
    destroyed: AtomicBool,
}

struct Binding {
    cpu: Arc<Cpu>,
    id: u64,
    parker: Parker,
    state: Arc<ContextState>,
    bootstrap: bool,
    detached: Cell<bool>,
}

thread_local! {
    static BINDING: RefCell<Option<Binding>> = const { RefCell::new(None) };
}

fn bind(binding: Binding) {
    BINDING.with(|b| *b.borrow_mut() = Some(binding));
}

/// Forget the context bound to the calling host thread.
pub fn unbind() {
    BINDING.with(|b| b.borrow_mut().take());
}

/// The CPU the calling host thread executes on, if any.
pub fn bound_cpu() -> Option<Arc<Cpu>> {
    BINDING.with(|b| b.borrow().as_ref().map(|b| b.cpu.clone()))
}

/// Identifier of the calling context.
pub fn current_id() -> Option<u64> {
    BINDING.with(|b| b.borrow().as_ref().map(|b| b.id))
}

/// Returns true when the calling context was destroyed and is unwinding.
pub fn is_detached() -> bool {
    BINDING.with(|b| b.borrow().as_ref().is_some_and(|b| b.detached.get()))
}

/// A handle to an execution context.
pub struct Context {
    id: u64,
    cpu: Arc<Cpu>,
    unparker: Unparker,
    state: Arc<ContextState>,
    bootstrap: bool,
}

impl Context {
    /// Create a context that runs `entry` once it is first resumed.
    ///
    /// # Errors
    /// Fails if the host cannot provide another thread.
    pub fn new<F>(cpu: &Arc<Cpu>, name: &str, entry: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = cpu.allocate_id();
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let state = Arc::new(ContextState::default());
        let binding = Binding {
            cpu: cpu.clone(),
            id,
            parker,
            state: state.clone(),
            bootstrap: false,
            detached: Cell::new(false),
        };

        std::thread::Builder::new()
            .name(name.into())
            .stack_size(STACK_SIZE)
            .spawn(move || {
                let cpu = binding.cpu.clone();
                bind(binding);
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    suspend();
                    entry()
                }));
                if let Err(payload) = result {
                    if !payload.is::<Destroyed>() {
                        cpu.halt(payload);
                    }
                }
                unbind();
            })?;

        Ok(Self {
            id,
            cpu: cpu.clone(),
            unparker,
            state,
            bootstrap: false,
        })
    }

    /// Adopt the calling host thread as the first context of `cpu`, which
    /// then owns the CPU.
    pub fn bootstrap(cpu: &Arc<Cpu>) -> Self {
        let id = cpu.allocate_id();
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let state = Arc::new(ContextState::default());
        cpu.register_bootstrap(unparker.clone());
        cpu.set_running(id);
        bind(Binding {
            cpu: cpu.clone(),
            id,
            parker,
            state: state.clone(),
            bootstrap: true,
            detached: Cell::new(false),
        });
        Self {
            id,
            cpu: cpu.clone(),
            unparker,
            state,
            bootstrap: true,
        }
    }

    /// Identifier of this context.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Hand the CPU over to this context.
    ///
    /// The caller must [`suspend`] right after, without touching the machine
    /// in between.
    pub fn resume(&self) {
        self.cpu.set_running(self.id);
        self.unparker.unpark();
    }

    /// Release this context. It must not be resumed again.
    ///
    /// The bootstrap context belongs to the host and is never released.
    pub fn destroy(&self) {
        if self.bootstrap {
            return;
        }
        self.state.destroyed.store(true, Ordering::SeqCst);
        self.unparker.unpark();
    }

    /// Returns true once [`Context::destroy`] has been called.
    pub fn is_destroyed(&self) -> bool {
        self.state.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Block the calling context until the CPU is handed back to it.
///
/// Never returns to a destroyed context: its host thread unwinds instead.
/// On the bootstrap context, a halt of the machine re-raises the panic that
/// caused it.
pub fn suspend() {
    BINDING.with(|b| {
        let b = b.borrow();
        let Some(b) = b.as_ref() else {
            panic!("suspend() called on a host thread without an execution context");
        };
        loop {
            if b.bootstrap && b.cpu.is_halted() {
                if let Some(payload) = b.cpu.take_halt_payload() {
                    b.cpu.set_running(b.id);
                    panic::resume_unwind(payload);
                }
            }
            if b.cpu.running() == b.id {
                return;
            }
            if b.state.destroyed.load(Ordering::SeqCst) {
                b.detached.set(true);
                panic::resume_unwind(Box::new(Destroyed));
            }
            b.parker.park();
        }
    })
}
