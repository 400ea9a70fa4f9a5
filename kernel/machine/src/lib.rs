//! The simulated machine the kernel runs on.
//!
//! This crate contains the hardware the kernel drives: a single CPU with its
//! interrupt controller, main memory, a software-walked MMU, a byte storage
//! device and a console. Everything is simulated on the host, so the kernel
//! can be booted from an ordinary test.
//!
//! You are **not** required to understand every line of code in this crate
//! to work on the kernel. The parts the kernel uses are
//! - [`context`]: execution contexts and the CPU baton,
//! - [`interrupt`]: the interrupt level and [`InterruptGuard`],
//! - [`mmu`]: page table entries and address translation,
//! - [`storage`] and [`console`]: the devices.
//!
//! [`InterruptGuard`]: interrupt::InterruptGuard

#[doc(hidden)]
#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod console;
pub mod context;
pub mod cpu;
pub mod interrupt;
pub mod memory;
pub mod mmu;
pub mod spinlock;
pub mod stats;
pub mod storage;

#[doc(hidden)]
pub use log;

pub use addressing::{Pa, Va};
pub use spinlock::SpinLock;

use std::sync::Arc;

/// Hardware parameters.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Number of physical frames.
    pub num_frames: usize,
    /// Preemption quantum of user code, in ticks. `None` disables the timer.
    pub time_slice: Option<u64>,
    /// Capacity of the storage device in bytes. `None` for unbounded.
    pub storage_capacity: Option<usize>,
    /// Bytes the console delivers as input.
    pub console_input: Vec<u8>,
    /// Copy console input to the console output.
    pub console_echo: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            num_frames: 32,
            time_slice: None,
            storage_capacity: None,
            console_input: Vec::new(),
            console_echo: false,
        }
    }
}

/// The machine.
pub struct Machine {
    /// The CPU.
    pub cpu: Arc<cpu::Cpu>,
    /// Main memory.
    pub memory: memory::MainMemory,
    /// The console.
    pub console: Arc<console::Console>,
    /// The storage device.
    pub storage: storage::Storage,
    /// Performance counters.
    pub stats: Arc<stats::Statistics>,
}

impl Machine {
    /// Power on a machine.
    pub fn new(config: &MachineConfig) -> Self {
        let stats = Arc::new(stats::Statistics::default());
        let cpu = cpu::Cpu::new(stats.clone(), config.time_slice);
        let console = console::Console::new(
            cpu.clone(),
            stats.clone(),
            &config.console_input,
            config.console_echo,
        );
        Self {
            memory: memory::MainMemory::new(config.num_frames),
            storage: storage::Storage::new(config.storage_capacity),
            console,
            cpu,
            stats,
        }
    }
}
