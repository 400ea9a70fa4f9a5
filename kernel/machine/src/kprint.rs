//! Kernel print utilities.
//!
//! Messages are emitted through the [`log`] facade so that the host test
//! harness can capture them, and rendered by [`KernelLogger`] as
//! `[LEVEL] message` lines on the standard error stream of the host.

use core::sync::atomic::{AtomicBool, Ordering};
use log::{Level, LevelFilter, Log, Metadata, Record};

/// Silences every kernel message when set.
pub static QUIET: AtomicBool = AtomicBool::new(false);

/// The logger installed by [`init`].
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        !QUIET.load(Ordering::SeqCst) && metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        eprintln!("[{tag}] {}", record.args());
    }

    fn flush(&self) {}
}

/// Install the kernel logger with the maximum level `level`.
///
/// Installing twice is harmless: the first logger stays, only the level is
/// updated.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Turn every kernel message on or off.
pub fn set_quiet(quiet: bool) {
    QUIET.store(quiet, Ordering::SeqCst);
}

/// Display an information message.
///
/// Use the format! syntax to write data to the log.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::log::info!(target: "kernel", $($arg)*));
}

/// Display a warning message.
///
/// Use the format! syntax to write data to the log.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => ($crate::log::warn!(target: "kernel", $($arg)*));
}

/// Display a debug message.
///
/// Use the format! syntax to write data to the log.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => ($crate::log::debug!(target: "kernel", $($arg)*));
}
