//! User programs.
//!
//! The machine has no instruction set simulator: a user program is a Rust
//! closure that plays the role of the instruction stream. It receives a
//! [`UserContext`], and every access it makes to its memory goes through the
//! MMU of its address space, exactly like a load or store would:
//!
//! - each access costs a user tick, and the time slice may expire, in which
//!   case the thread yields;
//! - touching an unmapped page raises a page fault that the kernel services
//!   transparently;
//! - any other exception (address error, bus error, read-only write)
//!   terminates the process with status -1.
//!
//! System calls are made with [`UserContext::syscall`] or the typed helpers
//! built on it. Strings passed to the kernel are first copied to the user
//! stack, as a C library would do.
//!
//! ```rust
//! use kernel::{Kernel, SystemConfigurationBuilder, mm::noff::ImageBuilder, process};
//!
//! let kernel = Kernel::boot(SystemConfigurationBuilder::new().set_quiet(true).build());
//! kernel
//!     .install("hello", &ImageBuilder::new().code(&[0; 16]).build(), |ctx| {
//!         ctx.print("hello, world\n");
//!         0
//!     })
//!     .unwrap();
//! kernel.run(|| {
//!     let id = process::exec("hello", &[], process::ExecPolicy::JOINABLE).unwrap();
//!     assert_eq!(process::join(id), 0);
//! });
//! assert_eq!(kernel.console_output(), "hello, world\n");
//! ```

use crate::{
    Kernel,
    mm::address_space::{AddressSpace, UserRegisters},
    process::{ExecPolicy, Process},
    syscall::{self, CONSOLE_INPUT, CONSOLE_OUTPUT, SyscallAbi, SyscallNumber},
    thread,
};
use machine::{
    addressing::Va,
    interrupt::TickMode,
    mmu::Exception,
};
use std::sync::Arc;

/// The code of a user program. The returned value is its exit status.
pub type UserProgram = Arc<dyn Fn(&mut UserContext) -> i32 + Send + Sync>;

/// The machine state of a running user thread.
pub struct UserContext {
    kernel: Arc<Kernel>,
    process: Arc<Process>,
    registers: UserRegisters,
    sp: Va,
}

impl UserContext {
    pub(crate) fn new(kernel: Arc<Kernel>, process: Arc<Process>, registers: UserRegisters) -> Self {
        Self {
            sp: registers.sp,
            kernel,
            process,
            registers,
        }
    }

    /// The registers the thread started with.
    pub fn registers(&self) -> UserRegisters {
        self.registers
    }

    /// Number of arguments.
    pub fn argc(&self) -> usize {
        self.registers.argc
    }

    /// The current stack pointer.
    pub fn sp(&self) -> Va {
        self.sp
    }

    /// The kernel.
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// The process the thread belongs to.
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// The address space of the process.
    pub fn space(&self) -> &Arc<AddressSpace> {
        self.process.space()
    }

    fn tick(&self) {
        if self.kernel.machine.cpu.interrupt.one_tick(TickMode::User) {
            thread::yield_now();
        }
    }

    fn raise(&self, e: Exception) -> ! {
        warning!(
            "Exception: {:?} at {:?} in `{}`.",
            e.kind,
            e.bad_vaddr,
            thread::current().name()
        );
        crate::process::exit(-1)
    }

    /// Load the byte at `va`.
    pub fn load_u8(&mut self, va: Va) -> u8 {
        self.tick();
        let mut byte = [0];
        if let Err(e) = self.space().read_bytes(&self.kernel, va, &mut byte) {
            self.raise(e)
        }
        byte[0]
    }

    /// Store `value` at `va`.
    pub fn store_u8(&mut self, va: Va, value: u8) {
        self.tick();
        if let Err(e) = self.space().write_bytes(&self.kernel, va, &[value]) {
            self.raise(e)
        }
    }

    /// Load the aligned word at `va`.
    pub fn load_u32(&mut self, va: Va) -> u32 {
        self.tick();
        match self.space().read_u32(&self.kernel, va) {
            Ok(v) => v,
            Err(e) => self.raise(e),
        }
    }

    /// Store the aligned word `value` at `va`.
    pub fn store_u32(&mut self, va: Va, value: u32) {
        self.tick();
        if let Err(e) = self.space().write_u32(&self.kernel, va, value) {
            self.raise(e)
        }
    }

    /// Load `len` bytes starting at `va`.
    pub fn load_bytes(&mut self, va: Va, len: usize) -> Vec<u8> {
        (0..len).map(|i| self.load_u8(va + i)).collect()
    }

    /// Store `data` starting at `va`.
    pub fn store_bytes(&mut self, va: Va, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.store_u8(va + i, *b);
        }
    }

    /// Load the NUL terminated string at `va`.
    pub fn load_str(&mut self, va: Va) -> Vec<u8> {
        let mut result = Vec::new();
        let mut va = va;
        loop {
            match self.load_u8(va) {
                0 => return result,
                b => result.push(b),
            }
            va += 1;
        }
    }

    /// Argument `i`. Argument 0 is the program name.
    pub fn arg(&mut self, i: usize) -> Option<String> {
        if i >= self.registers.argc {
            return None;
        }
        let ptr = self.load_u32(self.registers.argv + i * 4);
        let bytes = self.load_str(Va::new(ptr as usize));
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Every argument, program name first.
    pub fn args(&mut self) -> Vec<String> {
        (0..self.registers.argc).filter_map(|i| self.arg(i)).collect()
    }

    /// Copy `data` to the stack, word aligned, and return its address.
    pub fn push_bytes(&mut self, data: &[u8]) -> Va {
        self.sp = Va::new((self.sp.into_usize() - data.len()) & !3);
        let va = self.sp;
        self.store_bytes(va, data);
        va
    }

    /// Copy `s` to the stack with a terminating NUL and return its address.
    pub fn push_str(&mut self, s: &str) -> Va {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.push_bytes(&bytes)
    }

    /// Copy an array of pointers to the stack and return its address.
    pub fn push_ptrs(&mut self, ptrs: &[Va]) -> Va {
        self.sp = Va::new((self.sp.into_usize() - ptrs.len() * 4) & !3);
        let va = self.sp;
        for (i, ptr) in ptrs.iter().enumerate() {
            self.store_u32(va + i * 4, ptr.into_usize() as u32);
        }
        va
    }

    /// Raise a syscall exception with the registers `abi`. Returns the
    /// result register.
    pub fn syscall(&mut self, mut abi: SyscallAbi) -> isize {
        self.tick();
        syscall::dispatch(&mut abi);
        abi.return_value()
    }

    /// Stop the machine.
    pub fn halt(&mut self) -> ! {
        self.syscall(SyscallAbi::new(SyscallNumber::Halt, [0; 4]));
        unreachable!("Halt returned.")
    }

    /// Terminate the calling thread with `status`.
    pub fn exit(&mut self, status: i32) -> ! {
        self.syscall(SyscallAbi::new(
            SyscallNumber::Exit,
            [status as isize as usize, 0, 0, 0],
        ));
        unreachable!("Exit returned.")
    }

    /// Start the program `path` with `args`. Returns the SpaceId of the new
    /// process or a negative error number.
    pub fn exec(&mut self, path: &str, args: &[&str], policy: ExecPolicy) -> isize {
        let mark = self.sp;
        let path = self.push_str(path);
        let ptrs = args.iter().map(|arg| self.push_str(arg)).collect::<Vec<_>>();
        let argv = self.push_ptrs(&ptrs);
        let result = self.syscall(SyscallAbi::new(
            SyscallNumber::Exec,
            [
                path.into_usize(),
                args.len(),
                argv.into_usize(),
                policy.bits() as usize,
            ],
        ));
        self.sp = mark;
        result
    }

    /// Wait for process `id` to exit and return its exit status.
    pub fn join(&mut self, id: isize) -> i32 {
        self.syscall(SyscallAbi::new(SyscallNumber::Join, [id as usize, 0, 0, 0])) as i32
    }

    /// Read up to `size` bytes of the standard input into `buf`.
    pub fn read(&mut self, buf: Va, size: usize) -> isize {
        self.syscall(SyscallAbi::new(
            SyscallNumber::Read,
            [buf.into_usize(), size, CONSOLE_INPUT, 0],
        ))
    }

    /// Write `size` bytes at `buf` to the standard output.
    pub fn write(&mut self, buf: Va, size: usize) -> isize {
        self.syscall(SyscallAbi::new(
            SyscallNumber::Write,
            [buf.into_usize(), size, CONSOLE_OUTPUT, 0],
        ))
    }

    /// Read up to `max` bytes of the standard input through a stack buffer.
    pub fn input(&mut self, max: usize) -> Vec<u8> {
        let mark = self.sp;
        self.sp = Va::new((self.sp.into_usize() - max) & !3);
        let buf = self.sp;
        let n = self.read(buf, max);
        let data = if n > 0 {
            self.load_bytes(buf, n as usize)
        } else {
            Vec::new()
        };
        self.sp = mark;
        data
    }

    /// Write `s` to the standard output through a stack buffer.
    pub fn print(&mut self, s: &str) -> isize {
        let mark = self.sp;
        let buf = self.push_bytes(s.as_bytes());
        let result = self.write(buf, s.len());
        self.sp = mark;
        result
    }

    /// Start a thread of this process running `entry`.
    pub fn fork(&mut self, entry: impl Fn(&mut UserContext) -> i32 + Send + Sync + 'static) -> isize {
        let id = self.space().register_entry(Arc::new(entry));
        self.syscall(SyscallAbi::new(SyscallNumber::Fork, [id, 0, 0, 0]))
    }

    /// Give the CPU to another thread.
    pub fn yield_now(&mut self) {
        self.syscall(SyscallAbi::new(SyscallNumber::Yield, [0; 4]));
    }
}
