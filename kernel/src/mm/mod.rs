//! Memory Management.
//!
//! User memory is demand paged. Every user page starts unmapped; touching it
//! raises a page fault, and [`handle_page_fault`] makes it resident:
//!
//! 1. If the [`CoreMap`] is full, a victim is picked by the configured
//!    [`EvictionPolicy`], written to the backing store of its owner if it is
//!    dirty, and its frame is freed.
//! 2. A frame is taken from the [`FrameAllocator`] and filled from the
//!    executable, the backing store, or with zeros.
//!
//! [`CoreMap`]: core_map::CoreMap
//! [`FrameAllocator`]: frame::FrameAllocator
//! [`EvictionPolicy`]: crate::EvictionPolicy
pub mod address_space;
pub mod backing_store;
pub mod core_map;
pub mod frame;
pub mod noff;

use crate::{Kernel, KernelError};
use address_space::AddressSpace;
use machine::{addressing::Va, stats::Statistics};

/// Make the page containing `va` resident in `space`.
///
/// # Panics
/// Panics when no frame can be found, or when `va` lies outside of `space`.
pub fn handle_page_fault(kernel: &Kernel, space: &AddressSpace, va: Va) {
    let machine = &kernel.machine;
    Statistics::bump(&machine.stats.page_faults);

    if kernel.core_map.is_full() {
        if let Some(victim) = kernel.core_map.evict() {
            victim.store.page_out(victim.vpn, machine);
            kernel.frames.free(victim.frame);
            Statistics::bump(&machine.stats.evictions);
            debug!(
                "Evict: page {} of store {} from frame {}.",
                victim.vpn,
                victim.store.id(),
                victim.frame
            );
        }
    }

    match space.alloc_virtual_page(kernel, va) {
        Ok(()) => {}
        Err(KernelError::NoMemory) => panic!("Out of memory while faulting in {va:?}."),
        Err(e) => panic!("Cannot fault in {va:?}: {e}."),
    }
}
