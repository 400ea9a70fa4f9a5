//! User processes.
//!
//! A process is an [`AddressSpace`] plus the threads running in it. The
//! first thread is created by [`exec`]; more can be added with [`fork`].
//! Every thread of a process holds a [`Process`] handle that shares the
//! address space and carries the thread's own standard streams.
//!
//! Processes are named by their *SpaceId*: one more than their slot in the
//! process table, so that 0 is never a valid id.
//!
//! ## Pipelines
//!
//! The [`ExecPolicy`] of a process may ask for its output to go to a pipe,
//! for its input to come from one, or both. Pipes are connected through a
//! single pending slot: an [`exec`] that asks for one end takes the pending
//! pipe if there is one, and otherwise creates a pipe and leaves it pending
//! for the next [`exec`]. Executing `produce` with [`OUTPUT_PIPE`] and then
//! `consume` with [`INPUT_PIPE`] therefore connects the two, and a process
//! with both bits sits in the middle of a longer pipeline.
//!
//! [`OUTPUT_PIPE`]: ExecPolicy::OUTPUT_PIPE
//! [`INPUT_PIPE`]: ExecPolicy::INPUT_PIPE

use crate::{
    Kernel, KernelError,
    mm::address_space::{AddressSpace, MAX_ARGUMENT_LEN, UserRegisters},
    pipe::Pipe,
    teletype::Teletype,
    thread::{self, ThreadBuilder},
    user::{UserContext, UserProgram},
};
use bitflags::bitflags;
use machine::addressing::Va;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Value [`join`] returns when the process cannot be joined.
pub const JOIN_FAILED: i32 = -65535;

/// Longest executable path accepted, terminating NUL excluded.
pub const MAX_PATH_LEN: usize = 100;

bitflags! {
    /// How a process is started.
    pub struct ExecPolicy: u32 {
        /// The process can be joined.
        const JOINABLE = 1 << 0;
        /// Standard output goes to a pipe.
        const OUTPUT_PIPE = 1 << 1;
        /// Standard input comes from a pipe.
        const INPUT_PIPE = 1 << 2;
    }
}

/// The user side of a thread.
pub struct Process {
    space: Arc<AddressSpace>,
    policy: ExecPolicy,
    input: Option<Arc<Pipe>>,
    output: Option<Arc<Pipe>>,
    join_claimed: AtomicBool,
}

impl Process {
    fn new(
        space: Arc<AddressSpace>,
        policy: ExecPolicy,
        input: Option<Arc<Pipe>>,
        output: Option<Arc<Pipe>>,
    ) -> Self {
        Self {
            space,
            policy,
            input,
            output,
            join_claimed: AtomicBool::new(false),
        }
    }

    /// The address space.
    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    /// The policy the process was started with.
    pub fn policy(&self) -> ExecPolicy {
        self.policy
    }

    /// Standard input, if it is a pipe.
    pub fn input_pipe(&self) -> Option<&Arc<Pipe>> {
        self.input.as_ref()
    }

    /// Standard output, if it is a pipe.
    pub fn output_pipe(&self) -> Option<&Arc<Pipe>> {
        self.output.as_ref()
    }

    /// Standard input: the input pipe, or else the console.
    pub fn stdin<'a>(&'a self, kernel: &'a Kernel) -> &'a dyn Teletype {
        match self.input.as_deref() {
            Some(pipe) => pipe as &dyn Teletype,
            None => &kernel.console,
        }
    }

    /// Standard output: the output pipe, or else the console.
    pub fn stdout<'a>(&'a self, kernel: &'a Kernel) -> &'a dyn Teletype {
        match self.output.as_deref() {
            Some(pipe) => pipe as &dyn Teletype,
            None => &kernel.console,
        }
    }

    fn close_streams(&self) {
        if let Some(pipe) = self.input.as_ref() {
            pipe.close_read();
        }
        if let Some(pipe) = self.output.as_ref() {
            pipe.close_write();
        }
    }
}

fn take_or_leave(pending: &mut Option<Arc<Pipe>>, new_pipe: impl Fn() -> Arc<Pipe>) -> Arc<Pipe> {
    match pending.take() {
        Some(pipe) => pipe,
        None => {
            let pipe = new_pipe();
            *pending = Some(pipe.clone());
            pipe
        }
    }
}

/// The streams an exec wired, and the pipe that was pending before.
struct Wiring {
    previous: Option<Arc<Pipe>>,
    input: Option<Arc<Pipe>>,
    output: Option<Arc<Pipe>>,
}

impl Wiring {
    /// Undo the wiring of an exec that failed.
    ///
    /// The pending pipe goes back to what it was. A pipe taken from the
    /// pending slot stays open for the next exec; the ends of pipes this
    /// exec created are closed.
    fn rollback(self, kernel: &Kernel) {
        let mut pending = kernel.pending_pipe.lock();
        *pending = self.previous.clone();
        pending.unlock();

        let created = |pipe: &&Arc<Pipe>| {
            !self
                .previous
                .as_ref()
                .is_some_and(|previous| Arc::ptr_eq(previous, *pipe))
        };
        if let Some(pipe) = self.input.as_ref().filter(created) {
            pipe.close_read();
        }
        if let Some(pipe) = self.output.as_ref().filter(created) {
            pipe.close_write();
        }
    }
}

fn connect_pipes(kernel: &Kernel, policy: ExecPolicy) -> Wiring {
    let new_pipe = || Arc::new(Pipe::new(kernel.config().pipe_capacity));
    let mut pending = kernel.pending_pipe.lock();
    let previous = pending.clone();
    let (input, output) = match (
        policy.contains(ExecPolicy::INPUT_PIPE),
        policy.contains(ExecPolicy::OUTPUT_PIPE),
    ) {
        (true, true) => {
            let input = pending.take().unwrap_or_else(new_pipe);
            let output = new_pipe();
            *pending = Some(output.clone());
            (Some(input), Some(output))
        }
        (true, false) => (Some(take_or_leave(&mut pending, new_pipe)), None),
        (false, true) => (None, Some(take_or_leave(&mut pending, new_pipe))),
        (false, false) => (None, None),
    };
    pending.unlock();
    Wiring {
        previous,
        input,
        output,
    }
}

/// Start the program at `path` in a new process.
///
/// The program receives `path` as its first argument followed by `args`.
///
/// # Returns
/// The SpaceId of the new process.
///
/// # Errors
/// - [`KernelError::NameTooLong`]: `path` is too long.
/// - [`KernelError::ArgumentListTooLong`]: an argument is too long, or all
///   of them do not fit in the argument area.
/// - [`KernelError::NoSuchEntry`]: no executable at `path`.
/// - [`KernelError::NoExec`]: the executable is malformed.
/// - [`KernelError::TooManyProcesses`]: the store or process table is full.
/// - Any error creating the swap file.
pub fn exec(path: &str, args: &[&[u8]], policy: ExecPolicy) -> Result<usize, KernelError> {
    let kernel = thread::kernel();
    if path.len() > MAX_PATH_LEN {
        return Err(KernelError::NameTooLong);
    }
    let argv = std::iter::once(path.as_bytes())
        .chain(args.iter().copied())
        .map(<[u8]>::to_vec)
        .collect::<Vec<_>>();
    if argv.iter().any(|arg| arg.len() + 1 > MAX_ARGUMENT_LEN) {
        return Err(KernelError::ArgumentListTooLong);
    }

    let executable = kernel
        .machine
        .storage
        .open(path)
        .ok_or(KernelError::NoSuchEntry)?;
    let program = kernel.program(path).ok_or(KernelError::NoExec)?;

    let store_id = kernel
        .stores
        .reserve()
        .ok_or(KernelError::TooManyProcesses)?;
    let space = match AddressSpace::new(&kernel, executable, store_id) {
        Ok(space) => space,
        Err(e) => {
            kernel.stores.release(store_id);
            warning!("Exec: `{path}` rejected: {e}.");
            return Err(e);
        }
    };
    kernel.stores.fill(store_id, space.store().clone());

    let slot = match space
        .add_arguments(argv)
        .and_then(|_| kernel.processes.reserve().ok_or(KernelError::TooManyProcesses))
    {
        Ok(slot) => slot,
        Err(e) => {
            space.teardown(&kernel);
            return Err(e);
        }
    };

    let wiring = connect_pipes(&kernel, policy);
    let process = Arc::new(Process::new(
        space.clone(),
        policy,
        wiring.input.clone(),
        wiring.output.clone(),
    ));
    space.add_thread();
    let th = ThreadBuilder::new(path)
        .joinable(policy.contains(ExecPolicy::JOINABLE))
        .process(process.clone())
        .build();
    kernel.processes.fill(slot, th.clone());

    let k = kernel.clone();
    if let Err(e) = th.fork(move || start_process(k, process, program)) {
        kernel.processes.release(slot);
        wiring.rollback(&kernel);
        space.remove_thread();
        space.teardown(&kernel);
        return Err(e);
    }
    info!("Exec: `{path}` started as process {}.", slot + 1);
    Ok(slot + 1)
}

fn start_process(kernel: Arc<Kernel>, process: Arc<Process>, program: UserProgram) {
    match process.space.load_arguments(&kernel) {
        Ok(registers) => {
            let mut ctx = UserContext::new(kernel, process, registers);
            let status = program(&mut ctx);
            exit(status)
        }
        Err(e) => {
            warning!("Exec: cannot load the arguments: {e}.");
            exit(-1)
        }
    }
}

/// Terminate the calling thread of a user process with `status`.
///
/// The streams of the thread are closed, the process-table slots of the
/// threads of the space are freed, except those of joinable threads which
/// are freed by [`join`]. The last thread to leave an address space tears
/// it down.
pub fn exit(status: i32) -> ! {
    let kernel = thread::kernel();
    let current = thread::current();
    if let Some(process) = current.process() {
        info!("Exit: `{}` exits with {status}.", current.name());
        process.close_streams();
        kernel.processes.release_where(|th| {
            !th.is_joinable()
                && th
                    .process()
                    .is_some_and(|p| Arc::ptr_eq(&p.space, &process.space))
        });
        if process.space.remove_thread() == 0 {
            process.space.teardown(&kernel);
        }
    }
    thread::finish(status)
}

/// Wait for the process `id` to exit and return its exit status.
///
/// Returns [`JOIN_FAILED`] if `id` names no process, a process that is not
/// joinable, the caller itself, or a process someone else is joining.
pub fn join(id: usize) -> i32 {
    let kernel = thread::kernel();
    let Some(slot) = id.checked_sub(1) else {
        return JOIN_FAILED;
    };
    let Some(th) = kernel.processes.get(slot) else {
        warning!("Join: no process {id}.");
        return JOIN_FAILED;
    };
    if !th.is_joinable() || th.tid == thread::current().tid {
        warning!("Join: process {id} cannot be joined.");
        return JOIN_FAILED;
    }
    if th
        .process()
        .is_some_and(|p| p.join_claimed.swap(true, Ordering::SeqCst))
    {
        return JOIN_FAILED;
    }
    let status = th.join();
    kernel.processes.release(slot);
    status
}

/// Start a new thread of the calling process running `entry`.
///
/// The thread gets its own user stack in the shared address space, uses the
/// console for its streams and cannot be joined.
///
/// # Returns
/// The SpaceId of the new thread.
pub fn fork(entry: UserProgram) -> Result<usize, KernelError> {
    let kernel = thread::kernel();
    let current = thread::current();
    let space = current
        .process()
        .map(|p| p.space.clone())
        .ok_or(KernelError::InvalidArgument)?;

    let top = space.allocate_thread_space(&kernel)?;
    let slot = kernel
        .processes
        .reserve()
        .ok_or(KernelError::TooManyProcesses)?;
    let process = Arc::new(Process::new(space.clone(), ExecPolicy::empty(), None, None));
    space.add_thread();
    let th = ThreadBuilder::new(format!("{} (fork)", current.name()))
        .priority(current.priority())
        .process(process.clone())
        .build();
    kernel.processes.fill(slot, th.clone());

    let k = kernel.clone();
    let registers = UserRegisters {
        sp: top - 16,
        argc: 0,
        argv: Va::ZERO,
    };
    if let Err(e) = th.fork(move || {
        let mut ctx = UserContext::new(k, process, registers);
        let status = entry(&mut ctx);
        exit(status)
    }) {
        kernel.processes.release(slot);
        space.remove_thread();
        return Err(e);
    }
    debug!("Fork: `{}` started as process {}.", th.name(), slot + 1);
    Ok(slot + 1)
}
