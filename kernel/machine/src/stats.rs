//! Performance counters of the machine.
//!
//! The machine counts simulated time and device traffic; the kernel adds the
//! paging events it services.

use core::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated as the machine runs.
#[derive(Default, Debug)]
pub struct Statistics {
    /// Total simulated time.
    pub total_ticks: AtomicU64,
    /// Time spent idling with nothing ready to run.
    pub idle_ticks: AtomicU64,
    /// Time spent in kernel code.
    pub system_ticks: AtomicU64,
    /// Time spent in user code.
    pub user_ticks: AtomicU64,
    /// Characters delivered by the console.
    pub console_chars_read: AtomicU64,
    /// Characters printed on the console.
    pub console_chars_written: AtomicU64,
    /// Page faults taken by user code.
    pub page_faults: AtomicU64,
    /// Pages populated from an executable image or a swap file.
    pub page_ins: AtomicU64,
    /// Dirty pages written to a swap file.
    pub page_outs: AtomicU64,
    /// Resident pages chosen as eviction victims.
    pub evictions: AtomicU64,
}

/// A point-in-time copy of [`Statistics`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Total simulated time.
    pub total_ticks: u64,
    /// Time spent idling with nothing ready to run.
    pub idle_ticks: u64,
    /// Time spent in kernel code.
    pub system_ticks: u64,
    /// Time spent in user code.
    pub user_ticks: u64,
    /// Characters delivered by the console.
    pub console_chars_read: u64,
    /// Characters printed on the console.
    pub console_chars_written: u64,
    /// Page faults taken by user code.
    pub page_faults: u64,
    /// Pages populated from an executable image or a swap file.
    pub page_ins: u64,
    /// Dirty pages written to a swap file.
    pub page_outs: u64,
    /// Resident pages chosen as eviction victims.
    pub evictions: u64,
}

impl Statistics {
    /// Add one to `counter`.
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Take a [`Snapshot`] of every counter.
    pub fn snapshot(&self) -> Snapshot {
        let load = |c: &AtomicU64| c.load(Ordering::SeqCst);
        Snapshot {
            total_ticks: load(&self.total_ticks),
            idle_ticks: load(&self.idle_ticks),
            system_ticks: load(&self.system_ticks),
            user_ticks: load(&self.user_ticks),
            console_chars_read: load(&self.console_chars_read),
            console_chars_written: load(&self.console_chars_written),
            page_faults: load(&self.page_faults),
            page_ins: load(&self.page_ins),
            page_outs: load(&self.page_outs),
            evictions: load(&self.evictions),
        }
    }
}

impl core::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(
            f,
            "Ticks: total {}, idle {}, system {}, user {}",
            self.total_ticks, self.idle_ticks, self.system_ticks, self.user_ticks
        )?;
        writeln!(
            f,
            "Console I/O: reads {}, writes {}",
            self.console_chars_read, self.console_chars_written
        )?;
        write!(
            f,
            "Paging: faults {}, page-ins {}, page-outs {}, evictions {}",
            self.page_faults, self.page_ins, self.page_outs, self.evictions
        )
    }
}
