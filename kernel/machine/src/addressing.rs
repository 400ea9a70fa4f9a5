//! Physical and Virtual Memory Addressing Schemes.
//!
//! This module provides abstractions for user virtual addresses and
//! physical addresses of the simulated machine. A physical address indexes
//! the main memory of the machine directly: frame `n` occupies the bytes
//! `n * PAGE_SIZE .. (n + 1) * PAGE_SIZE`. A virtual address is an address in
//! the address space of a user process, and is translated by the MMU through
//! the page table of the running process.
//!
//! The module defines two types for memory addresses: [`Va`] for virtual
//! address, and [`Pa`] for physical address. Both support the small set of
//! arithmetic the kernel needs (offsetting by a byte count, splitting into a
//! page number and an in-page offset).
//!
//! ## Example Usage:
//!
//! ```
//! use machine::addressing::{PAGE_SIZE, Va};
//!
//! let va = Va::new(3 * PAGE_SIZE + 5);
//! assert_eq!(va.page_number(), 3);
//! assert_eq!(va.offset(), 5);
//! ```

/// The size of a single page (and frame) in memory, in bytes.
///
/// Pages are deliberately small so that a handful of pages already exercises
/// eviction and page-in paths.
pub const PAGE_SIZE: usize = 128;

/// The shift amount to get the page index from a given address.
pub const PAGE_SHIFT: usize = 7;

/// Divide `n` by `d` and round the result up.
///
/// ## Example:
/// ```
/// use machine::addressing::div_round_up;
///
/// assert_eq!(div_round_up(129, 128), 2);
/// ```
pub const fn div_round_up(n: usize, d: usize) -> usize {
    n.div_ceil(d)
}

/// Represents a physical address of the simulated main memory.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// Creates a new physical address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Physical address of the first byte of frame `frame`.
    #[inline]
    pub const fn from_frame(frame: usize) -> Self {
        Self(frame << PAGE_SHIFT)
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }
}

/// Represents a virtual address of a user process.
///
/// The address is a plain byte offset from the start of the address space;
/// the virtual page `n` covers `n * PAGE_SIZE .. (n + 1) * PAGE_SIZE`.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// The virtual address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new virtual address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Cast the virtual address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// The virtual page number that contains this address.
    #[inline]
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Extracts the offset within the page.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl core::ops::Add<usize> for Va {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

impl core::ops::Sub<usize> for Va {
    type Output = Self;

    fn sub(self, rhs: usize) -> Self {
        Self(self.0 - rhs)
    }
}

impl core::ops::AddAssign<usize> for Va {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs;
    }
}

impl core::ops::SubAssign<usize> for Va {
    fn sub_assign(&mut self, rhs: usize) {
        self.0 -= rhs;
    }
}

impl core::ops::Add<usize> for Pa {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
