//! Memory management unit.
//!
//! The MMU translates a user virtual address through a linear page table:
//! entry `n` of the table describes virtual page `n`. Every successful
//! translation sets the [`USE`] bit of the entry, and a write additionally
//! sets the [`DIRTY`] bit. There is no TLB; the page table of the running
//! process is consulted on every access.
//!
//! [`USE`]: PteFlags::USE
//! [`DIRTY`]: PteFlags::DIRTY

use crate::addressing::{PAGE_SIZE, Pa, Va};
use bitflags::bitflags;
use num_enum::TryFromPrimitive;

bitflags! {
    /// Flags of a page table entry.
    pub struct PteFlags: u32 {
        /// The entry maps a resident frame.
        const VALID = 1 << 0;
        /// Set by the MMU on every reference to the page.
        const USE = 1 << 1;
        /// Set by the MMU on every write to the page.
        const DIRTY = 1 << 2;
        /// Writes to the page raise [`ExceptionType::ReadOnly`].
        const READ_ONLY = 1 << 3;
    }
}

/// A page table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslationEntry {
    /// The virtual page this entry describes.
    pub virtual_page: usize,
    /// The frame backing the page, if one was ever assigned.
    pub physical_page: Option<usize>,
    /// Valid/use/dirty/read-only bits.
    pub flags: PteFlags,
}

impl TranslationEntry {
    /// An unmapped entry for virtual page `virtual_page`.
    pub fn invalid(virtual_page: usize) -> Self {
        Self {
            virtual_page,
            physical_page: None,
            flags: PteFlags::empty(),
        }
    }

    /// Returns true if the page is resident.
    pub fn is_valid(&self) -> bool {
        self.flags.contains(PteFlags::VALID)
    }
}

/// The exceptions user code can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ExceptionType {
    /// A program executed a system call.
    Syscall = 1,
    /// No valid translation found.
    PageFault,
    /// Write attempted to a page marked read-only.
    ReadOnly,
    /// Translation resulted in an invalid physical address.
    BusError,
    /// Unaligned reference or one that was beyond the end of the address
    /// space.
    AddressError,
    /// Integer overflow in add or sub.
    Overflow,
    /// Unimplemented or reserved instruction.
    IllegalInstruction,
}

/// An exception raised while translating `bad_vaddr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    /// What went wrong.
    pub kind: ExceptionType,
    /// The faulting virtual address.
    pub bad_vaddr: Va,
}

/// Translate `va` for an access of `size` bytes (1, 2 or 4).
///
/// # Returns
/// - `Ok(pa)`: the physical address; the USE (and, for writes, DIRTY) bit
///   of the entry is set.
/// - `Err(exception)`: the access must be handled by the kernel before it
///   can be retried, or it is illegal.
pub fn translate(
    table: &mut [TranslationEntry],
    num_frames: usize,
    va: Va,
    size: usize,
    writing: bool,
) -> Result<Pa, Exception> {
    let fault = |kind| Exception {
        kind,
        bad_vaddr: va,
    };

    if !matches!(size, 1 | 2 | 4) || va.into_usize() % size != 0 {
        return Err(fault(ExceptionType::AddressError));
    }
    let entry = table
        .get_mut(va.page_number())
        .ok_or(fault(ExceptionType::AddressError))?;
    if !entry.is_valid() {
        return Err(fault(ExceptionType::PageFault));
    }
    if writing && entry.flags.contains(PteFlags::READ_ONLY) {
        return Err(fault(ExceptionType::ReadOnly));
    }
    let frame = match entry.physical_page {
        Some(frame) if frame < num_frames => frame,
        _ => return Err(fault(ExceptionType::BusError)),
    };

    entry.flags |= PteFlags::USE;
    if writing {
        entry.flags |= PteFlags::DIRTY;
    }
    debug_assert!(va.offset() + size <= PAGE_SIZE);
    Ok(Pa::from_frame(frame) + va.offset())
}
