//! The `uaccess` module provides abstractions for interacting with user-space
//! memory in a kernel context.
//!
//! This module defines several types of user-space pointers that allow the
//! kernel to access the address space of the calling process with various
//! access modes:
//!
//! - [`UserPtrRO`]: A one-time, read-only pointer to a user-space word.
//! - [`UserPtrWO`]: A one-time, write-only pointer to a user-space word.
//! - [`UserU8SliceRO`]: A one-time, read-only pointer to a slice of `u8` in
//!   user-space.
//! - [`UserU8SliceWO`]: A one-time, write-only pointer to a slice of `u8` in
//!   user-space.
//! - [`UserCString`]: A utility to handle C-style null-terminated strings
//!   from user-space, bounded in length.
//!
//! Every access goes through the MMU of the calling process, faulting pages
//! in as needed. A range that does not fit in the address space, or an
//! access the MMU rejects, fails with [`KernelError::BadAddress`] instead of
//! terminating the process.
use crate::{Kernel, KernelError, mm::address_space::AddressSpace, thread};
use arrayvec::ArrayVec;
use machine::addressing::Va;

fn with_space<R>(
    f: impl FnOnce(&Kernel, &AddressSpace) -> Result<R, KernelError>,
) -> Result<R, KernelError> {
    let kernel = thread::kernel();
    let current = thread::current();
    let process = current.process().unwrap_or_else(|| {
        panic!(
            "User memory accessed from kernel thread `{}`.",
            current.name()
        )
    });
    f(&kernel, process.space())
}

fn access_ok(space: &AddressSpace, addr: usize, len: usize) -> Result<Va, KernelError> {
    match addr.checked_add(len) {
        Some(end) if end <= space.size() => Ok(Va::new(addr)),
        _ => Err(KernelError::BadAddress),
    }
}

/// A one-time, read-only pointer to a 32-bit user-space word.
///
/// Takes ownership of the pointer during operations, which prevents reusing
/// a checked pointer.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserPtrRO {
    addr: usize,
}

impl UserPtrRO {
    /// Creates a new `UserPtrRO` instance with the given user-space address.
    pub fn new(addr: usize) -> Self {
        UserPtrRO { addr }
    }

    /// Reads the little-endian word at the user-space address.
    pub fn get(self) -> Result<u32, KernelError> {
        with_space(|kernel, space| {
            let va = access_ok(space, self.addr, 4)?;
            space
                .read_u32(kernel, va)
                .map_err(|_| KernelError::BadAddress)
        })
    }
}

/// A one-time, write-only pointer to a 32-bit user-space word.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserPtrWO {
    addr: usize,
}

impl UserPtrWO {
    /// Creates a new `UserPtrWO` instance with the given user-space address.
    pub fn new(addr: usize) -> Self {
        UserPtrWO { addr }
    }

    /// Writes `value` to the user-space address.
    ///
    /// Returns `Ok(usize)` indicating the number of bytes written.
    pub fn put(self, value: u32) -> Result<usize, KernelError> {
        with_space(|kernel, space| {
            let va = access_ok(space, self.addr, 4)?;
            space
                .write_u32(kernel, va, value)
                .map_err(|_| KernelError::BadAddress)?;
            Ok(4)
        })
    }
}

/// A one-time, read-only pointer to a slice of `u8` in user-space.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserU8SliceRO {
    addr: usize,
    len: usize,
}

impl UserU8SliceRO {
    /// Creates a new `UserU8SliceRO` instance with the given user-space
    /// address and length.
    pub fn new(addr: usize, len: usize) -> Self {
        UserU8SliceRO { addr, len }
    }

    /// Reads data from the user-space buffer into a `Vec<u8>`.
    pub fn get(self) -> Result<Vec<u8>, KernelError> {
        with_space(|kernel, space| {
            let va = access_ok(space, self.addr, self.len)?;
            let mut result = vec![0; self.len];
            space
                .read_bytes(kernel, va, &mut result)
                .map_err(|_| KernelError::BadAddress)?;
            Ok(result)
        })
    }
}

/// A one-time, write-only pointer to a slice of `u8` in user-space.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserU8SliceWO {
    addr: usize,
    len: usize,
}

impl UserU8SliceWO {
    /// Creates a new `UserU8SliceWO` instance with the given user-space
    /// address and length.
    pub fn new(addr: usize, len: usize) -> Self {
        UserU8SliceWO { addr, len }
    }

    /// Checks that the buffer lies within the address space, without
    /// touching it.
    pub fn access_ok(&self) -> Result<(), KernelError> {
        with_space(|_, space| access_ok(space, self.addr, self.len).map(|_| ()))
    }

    /// Writes data from a slice to the user-space buffer.
    ///
    /// Returns `Ok(usize)` indicating the number of bytes written, at most
    /// the length of the buffer.
    pub fn put(self, other: &[u8]) -> Result<usize, KernelError> {
        let size = self.len.min(other.len());
        with_space(|kernel, space| {
            let va = access_ok(space, self.addr, self.len)?;
            space
                .write_bytes(kernel, va, &other[..size])
                .map_err(|_| KernelError::BadAddress)?;
            Ok(size)
        })
    }
}

/// A pointer to a null-terminated C-style string of at most `N` bytes in
/// user-space.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserCString<const N: usize> {
    addr: usize,
}

impl<const N: usize> UserCString<N> {
    /// Creates a new `UserCString` instance with the given user-space address.
    pub fn new(addr: usize) -> Self {
        Self { addr }
    }

    /// Reads the bytes up to the null terminator.
    ///
    /// Returns `Err(KernelError::NameTooLong)` if no terminator is found
    /// within `N` bytes.
    pub fn read_bytes(self) -> Result<ArrayVec<u8, N>, KernelError> {
        with_space(|kernel, space| {
            let mut result = ArrayVec::new();
            let mut byte = [0];
            for offset in 0..=N {
                let addr = self.addr.checked_add(offset).ok_or(KernelError::BadAddress)?;
                let va = access_ok(space, addr, 1)?;
                space
                    .read_bytes(kernel, va, &mut byte)
                    .map_err(|_| KernelError::BadAddress)?;
                if byte[0] == 0 {
                    return Ok(result);
                }
                result
                    .try_push(byte[0])
                    .map_err(|_| KernelError::NameTooLong)?;
            }
            Err(KernelError::NameTooLong)
        })
    }

    /// Reads a null-terminated UTF-8 string.
    pub fn read(self) -> Result<String, KernelError> {
        let bytes = self.read_bytes()?;
        core::str::from_utf8(&bytes)
            .map(String::from)
            .map_err(|_| KernelError::InvalidArgument)
    }
}
