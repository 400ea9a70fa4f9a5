//! System call infrastructure.
//!
//! A user program requests a service by raising a syscall exception with the
//! system call number and up to four arguments in registers; the result
//! comes back in a single register. The kernel sees that register file as a
//! [`SyscallAbi`], and [`dispatch`] serves it.
//!
//! | Number | Call  | Arguments                   | Returns                      |
//! |--------|-------|-----------------------------|------------------------------|
//! | 0      | Halt  |                             | never                        |
//! | 1      | Exit  | status                      | never                        |
//! | 2      | Exec  | path, argc, argv, policy    | SpaceId                      |
//! | 3      | Join  | SpaceId                     | exit status or `JOIN_FAILED` |
//! | 6      | Read  | buffer, size, fd            | bytes read                   |
//! | 7      | Write | buffer, size, fd            | bytes written                |
//! | 9      | Fork  | entry                       | SpaceId                      |
//! | 10     | Yield |                             | 0                            |
//!
//! Failures are returned as negative error numbers, see
//! [`KernelError::into_usize`]. An unknown system call number terminates
//! the caller with status -1.
//!
//! [`KernelError::into_usize`]: crate::KernelError::into_usize

pub mod uaccess;

use crate::{
    KernelError,
    mm::address_space::{ARGUMENT_SIZE, MAX_ARGUMENT_LEN},
    process::{self, ExecPolicy, MAX_PATH_LEN},
    thread,
};
use num_enum::TryFromPrimitive;
use uaccess::{UserCString, UserPtrRO, UserU8SliceRO, UserU8SliceWO};

/// File descriptor of the standard input.
pub const CONSOLE_INPUT: usize = 0;
/// File descriptor of the standard output.
pub const CONSOLE_OUTPUT: usize = 1;

/// System call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(usize)]
pub enum SyscallNumber {
    /// Stop the machine.
    Halt = 0,
    /// Terminate the calling thread.
    Exit = 1,
    /// Start a program in a new process.
    Exec = 2,
    /// Wait for a process to exit.
    Join = 3,
    /// Read from the standard input.
    Read = 6,
    /// Write to the standard output.
    Write = 7,
    /// Start a thread in the calling process.
    Fork = 9,
    /// Give the CPU to another thread.
    Yield = 10,
}

/// A struct representing the system call ABI (Application Binary Interface).
///
/// It stores the system call number and up to four arguments passed to the
/// kernel, and the register the result is written to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallAbi {
    /// The system call number that identifies the requested system service.
    pub sysno: usize,
    /// First argument for the system call.
    pub arg1: usize,
    /// Second argument for the system call.
    pub arg2: usize,
    /// Third argument for the system call.
    pub arg3: usize,
    /// Fourth argument for the system call.
    pub arg4: usize,
    /// The result register.
    pub ret: usize,
}

impl SyscallAbi {
    /// Build a request for system call `sysno`.
    pub fn new(sysno: SyscallNumber, args: [usize; 4]) -> Self {
        let [arg1, arg2, arg3, arg4] = args;
        Self {
            sysno: sysno as usize,
            arg1,
            arg2,
            arg3,
            arg4,
            ret: 0,
        }
    }

    /// Sets the return value for the system call.
    ///
    /// If the system call was successful, the result register holds the
    /// returned value. Otherwise it holds the error code given by
    /// [`KernelError::into_usize`].
    pub fn set_return_value(&mut self, return_val: Result<usize, KernelError>) {
        self.ret = match return_val {
            Ok(v) => v,
            Err(e) => e.into_usize(),
        };
    }

    /// The result register, as a signed value.
    pub fn return_value(&self) -> isize {
        self.ret as isize
    }
}

/// Serve the system call described by `abi` for the calling user thread.
pub fn dispatch(abi: &mut SyscallAbi) {
    let Ok(sysno) = SyscallNumber::try_from(abi.sysno) else {
        warning!(
            "Syscall: `{}` made unknown system call {}.",
            thread::current().name(),
            abi.sysno
        );
        process::exit(-1)
    };
    debug!("Syscall: {sysno:?} {abi:x?}.");
    let return_val = match sysno {
        SyscallNumber::Halt => thread::kernel().halt(),
        SyscallNumber::Exit => process::exit(abi.arg1 as i32),
        SyscallNumber::Exec => exec(abi),
        SyscallNumber::Join => Ok(process::join(abi.arg1) as isize as usize),
        SyscallNumber::Read => read(abi),
        SyscallNumber::Write => write(abi),
        SyscallNumber::Fork => fork(abi),
        SyscallNumber::Yield => {
            thread::yield_now();
            Ok(0)
        }
    };
    abi.set_return_value(return_val);
}

fn exec(abi: &SyscallAbi) -> Result<usize, KernelError> {
    let path = UserCString::<MAX_PATH_LEN>::new(abi.arg1).read()?;
    let (argc, argv) = (abi.arg2, abi.arg3);
    // Each argument takes at least a pointer in the argument area.
    if argc > ARGUMENT_SIZE / 4 {
        return Err(KernelError::ArgumentListTooLong);
    }
    let mut args = Vec::new();
    for i in 0..argc {
        let slot = argv.checked_add(i * 4).ok_or(KernelError::BadAddress)?;
        let ptr = UserPtrRO::new(slot).get()?;
        let arg = UserCString::<MAX_ARGUMENT_LEN>::new(ptr as usize)
            .read_bytes()
            .map_err(|e| match e {
                KernelError::NameTooLong => KernelError::ArgumentListTooLong,
                e => e,
            })?;
        args.push(arg);
    }
    let policy = ExecPolicy::from_bits(abi.arg4 as u32).ok_or(KernelError::InvalidArgument)?;
    let args = args.iter().map(|arg| arg.as_slice()).collect::<Vec<_>>();
    process::exec(&path, &args, policy)
}

fn read(abi: &SyscallAbi) -> Result<usize, KernelError> {
    let (addr, size, fd) = (abi.arg1, abi.arg2, abi.arg3);
    if fd != CONSOLE_INPUT {
        return Err(KernelError::BadFileDescriptor);
    }
    let buffer = UserU8SliceWO::new(addr, size);
    buffer.access_ok()?;

    let kernel = thread::kernel();
    let current = thread::current();
    let process = current.process().ok_or(KernelError::BadFileDescriptor)?;
    let mut data = vec![0; size];
    let count = process.stdin(&kernel).read(&mut data)?;
    buffer.put(&data[..count])
}

fn write(abi: &SyscallAbi) -> Result<usize, KernelError> {
    let (addr, size, fd) = (abi.arg1, abi.arg2, abi.arg3);
    if fd != CONSOLE_OUTPUT {
        return Err(KernelError::BadFileDescriptor);
    }
    let data = UserU8SliceRO::new(addr, size).get()?;

    let kernel = thread::kernel();
    let current = thread::current();
    let process = current.process().ok_or(KernelError::BadFileDescriptor)?;
    process.stdout(&kernel).write(&data)
}

fn fork(abi: &SyscallAbi) -> Result<usize, KernelError> {
    let current = thread::current();
    let process = current.process().ok_or(KernelError::InvalidArgument)?;
    let entry = process
        .space()
        .entry_point(abi.arg1)
        .ok_or(KernelError::InvalidArgument)?;
    process::fork(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_negative_numbers() {
        let mut abi = SyscallAbi::new(SyscallNumber::Read, [0x40, 4, CONSOLE_INPUT, 0]);
        abi.set_return_value(Ok(3));
        assert_eq!(abi.return_value(), 3);
        abi.set_return_value(Err(KernelError::BadAddress));
        assert_eq!(abi.return_value(), -14);
        assert_eq!(
            KernelError::try_from(abi.return_value()),
            Ok(KernelError::BadAddress)
        );
    }

    #[test]
    fn numbering() {
        assert_eq!(SyscallNumber::try_from(7), Ok(SyscallNumber::Write));
        assert_eq!(SyscallNumber::try_from(10), Ok(SyscallNumber::Yield));
        assert!(SyscallNumber::try_from(4).is_err());
        assert!(SyscallNumber::try_from(8).is_err());
    }
}
