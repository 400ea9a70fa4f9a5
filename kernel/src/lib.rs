//! # An instructional kernel
//!
//! This crate is the core of a small teaching kernel: synchronization
//! primitives, a priority-aware scheduler, the thread lifecycle, demand paged
//! virtual memory with eviction to per-process swap files, pipes and the
//! system call layer that glues user processes to all of it.
//!
//! The kernel runs on the simulated machine of the [`machine`] crate. The
//! machine has a single CPU, so exactly one kernel thread executes at a time
//! and concurrency only arises when a thread blocks, yields, or when an
//! interrupt is delivered. The kernel itself is never preempted; user code is
//! preempted at instruction boundaries when a time slice is configured.
//!
//! ## Booting
//!
//! A kernel is created with [`Kernel::boot`] from a [`SystemConfiguration`],
//! and started with [`Kernel::run`], which adopts the calling host thread as
//! the `main` kernel thread:
//!
//! ```rust
//! use kernel::{Kernel, SystemConfigurationBuilder, sync::Semaphore, thread::ThreadBuilder};
//! use std::sync::Arc;
//!
//! let kernel = Kernel::boot(SystemConfigurationBuilder::new().set_quiet(true).build());
//! kernel.run(|| {
//!     let sema = Arc::new(Semaphore::new("done", 0));
//!     let s = sema.clone();
//!     ThreadBuilder::new("worker").spawn(move || s.v()).unwrap();
//!     sema.p();
//! });
//! ```
//!
//! ## Structure
//!
//! - [`sync`]: [`Semaphore`], [`Lock`] and [`Condition`], built on priority
//!   ordered wait queues.
//! - [`thread`]: thread control blocks, fork/yield/sleep/finish/join, and the
//!   [`Scheduler`].
//! - [`mm`]: frame allocation, the core map, backing stores and address
//!   spaces.
//! - [`process`] and [`syscall`]: user processes and the system call layer.
//! - [`pipe`], [`table`] and [`teletype`]: the remaining kernel services.
//!
//! [`Semaphore`]: sync::Semaphore
//! [`Lock`]: sync::Lock
//! [`Condition`]: sync::Condition
//! [`Scheduler`]: thread::scheduler::Scheduler
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

#[macro_use]
extern crate machine;

pub mod mm;
pub mod pipe;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod table;
pub mod teletype;
pub mod thread;
pub mod user;

pub use machine::{addressing, debug, info, warning};

use crossbeam_queue::SegQueue;
use log::LevelFilter;
use machine::{
    Machine, MachineConfig,
    context::{self, Context},
    interrupt::InterruptState,
    spinlock::SpinLock,
    storage::StorageError,
};
use mm::{backing_store::BackingStore, core_map::CoreMap, frame::FrameAllocator};
use pipe::Pipe;
use std::{
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use table::Table;
use teletype::SynchConsole;
use thread::{
    Thread, ThreadStatus,
    scheduler::{Fifo, PriorityScheduler, Scheduler},
};
use thiserror::Error;
use user::{UserContext, UserProgram};

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might occur
/// while serving a request. These errors are returned to user programs as
/// negative error numbers through [`KernelError::into_usize`].
#[derive(Debug, Error, Eq, PartialEq, Clone, Copy)]
pub enum KernelError {
    /// No such file or directory. (ENOENT)
    #[error("no such file or directory")]
    NoSuchEntry,
    /// IO Error. (EIO)
    #[error("input/output error")]
    IOError,
    /// Argument list too long. (E2BIG)
    #[error("argument list too long")]
    ArgumentListTooLong,
    /// Exec format error. (ENOEXEC)
    #[error("exec format error")]
    NoExec,
    /// BAD file descriptor. (EBADF)
    #[error("bad file descriptor")]
    BadFileDescriptor,
    /// No more processes. (EAGAIN)
    #[error("too many processes")]
    TooManyProcesses,
    /// Out of memory. (ENOMEM)
    #[error("out of memory")]
    NoMemory,
    /// Bad address. (EFAULT)
    #[error("bad address")]
    BadAddress,
    /// File exists. (EEXIST)
    #[error("file exists")]
    FileExist,
    /// Invalid arguement. (EINVAL)
    #[error("invalid argument")]
    InvalidArgument,
    /// No space left on device. (ENOSPC)
    #[error("no space left on device")]
    NoSpace,
    /// Broken pipe. (EPIPE)
    #[error("broken pipe")]
    BrokenPipe,
    /// File name too long. (ENAMETOOLONG)
    #[error("file name too long")]
    NameTooLong,
    /// Invalid system call number. (ENOSYS)
    #[error("invalid system call number")]
    NoSuchSyscall,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code. The result is cast to `usize` for use as a return value in
    /// system calls.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::NoSuchEntry => -2isize,
            KernelError::IOError => -5,
            KernelError::ArgumentListTooLong => -7,
            KernelError::NoExec => -8,
            KernelError::BadFileDescriptor => -9,
            KernelError::TooManyProcesses => -11,
            KernelError::NoMemory => -12,
            KernelError::BadAddress => -14,
            KernelError::FileExist => -17,
            KernelError::InvalidArgument => -22,
            KernelError::NoSpace => -28,
            KernelError::BrokenPipe => -32,
            KernelError::NameTooLong => -36,
            KernelError::NoSuchSyscall => -38,
        }) as usize
    }
}

/// The given `isize` does not indicate an [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -2 => Ok(Self::NoSuchEntry),
            -5 => Ok(Self::IOError),
            -7 => Ok(Self::ArgumentListTooLong),
            -8 => Ok(Self::NoExec),
            -9 => Ok(Self::BadFileDescriptor),
            -11 => Ok(Self::TooManyProcesses),
            -12 => Ok(Self::NoMemory),
            -14 => Ok(Self::BadAddress),
            -17 => Ok(Self::FileExist),
            -22 => Ok(Self::InvalidArgument),
            -28 => Ok(Self::NoSpace),
            -32 => Ok(Self::BrokenPipe),
            -36 => Ok(Self::NameTooLong),
            -38 => Ok(Self::NoSuchSyscall),
            e => Err(TryFromError { e }),
        }
    }
}

impl From<StorageError> for KernelError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::AlreadyExists(_) => KernelError::FileExist,
            StorageError::NotFound(_) => KernelError::NoSuchEntry,
            StorageError::NoSpace { .. } => KernelError::NoSpace,
        }
    }
}

impl From<std::io::Error> for KernelError {
    fn from(_: std::io::Error) -> Self {
        KernelError::NoMemory
    }
}

/// Page replacement policy of the [`CoreMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Evict the page that became resident first.
    #[default]
    Fifo,
    /// Clock algorithm: pages referenced since the last scan are spared once.
    SecondChance,
}

/// Which [`Scheduler`] the kernel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    /// Highest priority first, arrival order among equals.
    #[default]
    Priority,
    /// Arrival order only.
    Fifo,
}

/// System-wide settings, fixed at boot.
///
/// Build one with [`SystemConfigurationBuilder`].
#[derive(Debug, Clone)]
pub struct SystemConfiguration {
    /// Number of physical frames.
    pub num_frames: usize,
    /// Page replacement policy.
    pub eviction_policy: EvictionPolicy,
    /// Scheduling policy.
    pub scheduling_policy: SchedulingPolicy,
    /// Preemption quantum of user code in ticks, or `None` for none.
    pub time_slice: Option<u64>,
    /// Size of the process table.
    pub max_processes: usize,
    /// Size of the backing store table.
    pub max_stores: usize,
    /// Capacity of each pipe in bytes.
    pub pipe_capacity: usize,
    /// Capacity of the storage device in bytes, or `None` for unbounded.
    pub storage_capacity: Option<usize>,
    /// Bytes delivered by the console.
    pub console_input: Vec<u8>,
    /// Echo console input to the console output.
    pub console_echo: bool,
    /// Silence every kernel message.
    pub quiet: bool,
    /// Most verbose level of kernel messages.
    pub log_level: LevelFilter,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            num_frames: 32,
            eviction_policy: EvictionPolicy::default(),
            scheduling_policy: SchedulingPolicy::default(),
            time_slice: None,
            max_processes: 64,
            max_stores: 64,
            pipe_capacity: 128,
            storage_capacity: None,
            console_input: Vec::new(),
            console_echo: false,
            quiet: false,
            log_level: LevelFilter::Info,
        }
    }
}

/// A builder for system configuration settings.
///
/// The [`SystemConfigurationBuilder`] struct provides an interface for
/// configuring various system-wide settings before the kernel boots, such as
/// the scheduling policy, the amount of physical memory and the page
/// replacement policy.
///
/// ```rust
/// use kernel::{EvictionPolicy, SystemConfigurationBuilder};
///
/// let config = SystemConfigurationBuilder::new()
///     .set_num_frames(4)
///     .set_eviction_policy(EvictionPolicy::SecondChance)
///     .build();
/// assert_eq!(config.num_frames, 4);
/// ```
#[derive(Default)]
pub struct SystemConfigurationBuilder {
    config: SystemConfiguration,
}

impl SystemConfigurationBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the system-wide scheduler.
    pub fn set_scheduler(mut self, policy: SchedulingPolicy) -> Self {
        self.config.scheduling_policy = policy;
        self
    }

    /// Sets the number of physical frames.
    pub fn set_num_frames(mut self, num_frames: usize) -> Self {
        self.config.num_frames = num_frames;
        self
    }

    /// Sets the page replacement policy.
    pub fn set_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.config.eviction_policy = policy;
        self
    }

    /// Preempt user code every `ticks` ticks.
    pub fn set_time_slice(mut self, ticks: u64) -> Self {
        self.config.time_slice = Some(ticks);
        self
    }

    /// Sets the size of the process table.
    pub fn set_max_processes(mut self, n: usize) -> Self {
        self.config.max_processes = n;
        self
    }

    /// Sets the size of the backing store table.
    pub fn set_max_stores(mut self, n: usize) -> Self {
        self.config.max_stores = n;
        self
    }

    /// Sets the capacity of pipes.
    pub fn set_pipe_capacity(mut self, capacity: usize) -> Self {
        self.config.pipe_capacity = capacity;
        self
    }

    /// Bound the storage device to `bytes` bytes.
    pub fn set_storage_capacity(mut self, bytes: usize) -> Self {
        self.config.storage_capacity = Some(bytes);
        self
    }

    /// Sets the bytes the console delivers as input.
    pub fn set_console_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.config.console_input = input.into();
        self
    }

    /// Echo console input to the console output.
    pub fn set_console_echo(mut self, echo: bool) -> Self {
        self.config.console_echo = echo;
        self
    }

    /// Silence every kernel message.
    pub fn set_quiet(mut self, quiet: bool) -> Self {
        self.config.quiet = quiet;
        self
    }

    /// Sets the most verbose level of kernel messages.
    pub fn set_log_level(mut self, level: LevelFilter) -> Self {
        self.config.log_level = level;
        self
    }

    /// Finish the configuration.
    pub fn build(self) -> SystemConfiguration {
        self.config
    }
}

/// Unwinding payload of a halt requested by the kernel or a user program.
struct Halt;

/// The kernel.
///
/// Everything that is global to the system lives here: the machine, the
/// scheduler, the memory manager and the process and backing store tables.
/// Kernel threads reach it with [`thread::kernel`].
pub struct Kernel {
    /// The machine the kernel runs on.
    pub machine: Machine,
    config: SystemConfiguration,
    pub(crate) scheduler: Box<dyn Scheduler>,
    pub(crate) destroy_queue: SegQueue<Arc<Thread>>,
    threads: SpinLock<BTreeMap<u64, Arc<Thread>>>,
    pub(crate) frames: FrameAllocator,
    pub(crate) core_map: CoreMap,
    pub(crate) console: SynchConsole,
    pub(crate) processes: Table<Arc<Thread>>,
    pub(crate) stores: Table<Arc<BackingStore>>,
    pub(crate) pending_pipe: SpinLock<Option<Arc<Pipe>>>,
    programs: SpinLock<BTreeMap<String, UserProgram>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Kernel {
    /// Boot a kernel on a fresh machine.
    pub fn boot(config: SystemConfiguration) -> Arc<Self> {
        machine::kprint::init(config.log_level);
        machine::kprint::set_quiet(config.quiet);

        let machine = Machine::new(&MachineConfig {
            num_frames: config.num_frames,
            time_slice: config.time_slice,
            storage_capacity: config.storage_capacity,
            console_input: config.console_input.clone(),
            console_echo: config.console_echo,
        });
        info!(
            "Memory: {} frames of {} bytes.",
            config.num_frames,
            addressing::PAGE_SIZE
        );

        let scheduler: Box<dyn Scheduler> = match config.scheduling_policy {
            SchedulingPolicy::Priority => Box::new(PriorityScheduler::new()),
            SchedulingPolicy::Fifo => Box::new(Fifo::new()),
        };
        let console = SynchConsole::new(machine.console.clone());

        Arc::new(Self {
            frames: FrameAllocator::new(config.num_frames),
            core_map: CoreMap::new(config.num_frames, config.eviction_policy),
            processes: Table::new("process table", config.max_processes),
            stores: Table::new("store table", config.max_stores),
            pending_pipe: SpinLock::new(None),
            programs: SpinLock::new(BTreeMap::new()),
            threads: SpinLock::new(BTreeMap::new()),
            destroy_queue: SegQueue::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            scheduler,
            console,
            machine,
            config,
        })
    }

    /// The configuration the kernel was booted with.
    pub fn config(&self) -> &SystemConfiguration {
        &self.config
    }

    /// Store an executable image at `path` together with the program that
    /// runs when it is executed.
    pub fn install(
        &self,
        path: &str,
        image: &[u8],
        program: impl Fn(&mut UserContext) -> i32 + Send + Sync + 'static,
    ) -> Result<(), KernelError> {
        self.machine.storage.write_file(path, image)?;
        let mut programs = self.programs.lock();
        programs.insert(path.into(), Arc::new(program));
        programs.unlock();
        Ok(())
    }

    pub(crate) fn program(&self, path: &str) -> Option<UserProgram> {
        let programs = self.programs.lock();
        let program = programs.get(path).cloned();
        programs.unlock();
        program
    }

    /// Run `f` as the `main` kernel thread on the calling host thread.
    ///
    /// Once `f` returns, the kernel keeps running until no thread is ready
    /// and no interrupt is pending, then shuts down: threads that are still
    /// blocked are torn down. A [`halt`] ends the run early.
    ///
    /// # Panics
    /// A panic on any kernel thread stops the kernel and is re-raised here.
    ///
    /// [`halt`]: Kernel::halt
    pub fn run(self: &Arc<Self>, f: impl FnOnce()) {
        assert!(
            !self.started.swap(true, Ordering::SeqCst),
            "Kernel::run() called twice"
        );
        struct Shutdown<'a>(&'a Arc<Kernel>);
        impl Drop for Shutdown<'_> {
            fn drop(&mut self) {
                self.0.shutdown();
            }
        }

        let main = Thread::new("main", 0, false, None);
        main.set_context(Context::bootstrap(&self.machine.cpu));
        main.set_status(ThreadStatus::Running);
        self.register(main.clone());
        thread::bind(self.clone(), main);
        let _shutdown = Shutdown(self);
        InterruptState::enable();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            f();
            self.drain();
        }));
        match result {
            Ok(()) => info!("Kernel: no more work to do."),
            Err(payload) if payload.is::<Halt>() => info!("Kernel: halted."),
            Err(payload) => panic::resume_unwind(payload),
        }
        info!("{}", self.machine.stats.snapshot());
    }

    fn drain(&self) {
        loop {
            if self.scheduler.has_ready() {
                thread::yield_now();
            } else if !self.machine.cpu.interrupt.idle() {
                break;
            }
        }
    }

    /// Stop the kernel from any kernel thread. [`Kernel::run`] returns.
    pub fn halt(&self) -> ! {
        info!("Kernel: halt requested by {}.", thread::current().name());
        panic::resume_unwind(Box::new(Halt))
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        InterruptState::disable();
        let mut threads = self.threads.lock();
        let threads_left = std::mem::take(&mut *threads);
        threads.unlock();
        for th in threads_left.values() {
            th.destroy_context();
        }
        while self.destroy_queue.pop().is_some() {}
        thread::unbind();
        context::unbind();
    }

    /// Returns true while the kernel serves threads.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
            && !self.stopped.load(Ordering::SeqCst)
            && !self.machine.cpu.is_halted()
    }

    pub(crate) fn register(&self, th: Arc<Thread>) {
        let mut threads = self.threads.lock();
        threads.insert(th.tid, th);
        threads.unlock();
    }

    pub(crate) fn unregister(&self, tid: u64) {
        let mut threads = self.threads.lock();
        threads.remove(&tid);
        threads.unlock();
    }

    /// Number of kernel threads that have not been destroyed yet.
    pub fn live_threads(&self) -> usize {
        let threads = self.threads.lock();
        let n = threads.len();
        threads.unlock();
        n
    }

    /// Number of physical frames not holding a user page.
    ///
    /// # Panics
    /// Panics if called outside of a kernel thread.
    pub fn free_frames(&self) -> usize {
        self.frames.free_count()
    }

    /// Number of resident user pages.
    pub fn resident_pages(&self) -> usize {
        self.core_map.len()
    }

    /// Everything the console printed so far.
    pub fn console_output(&self) -> String {
        self.machine.console.output_string()
    }
}
