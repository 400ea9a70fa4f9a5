//! A teletype (TTY) interface for character-based I/O.
//!
//! This module provides a trait [`Teletype`] that defines an interface for
//! reading from and writing to a character stream. The standard streams of a
//! user process are teletypes: the [`SynchConsole`], or one end of a
//! [`Pipe`].
//!
//! [`Pipe`]: crate::pipe::Pipe

use crate::{
    KernelError,
    sync::{Lock, Semaphore},
};
use machine::console::Console;
use std::sync::Arc;

/// The `Teletype` trait represents a generic character-based input/output
/// stream.
///
/// Implementations of this trait define methods for:
/// - Writing data to the teletype (`write`)
/// - Reading data from the teletype (`read`)
pub trait Teletype {
    /// Writes data to the teletype.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes successfully written. It is short
    ///   when the stream stops accepting data.
    /// - `Err(KernelError)`: If the write operation failed.
    fn write(&self, data: &[u8]) -> Result<usize, KernelError>;

    /// Reads data from the teletype.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes read. It is short when the stream
    ///   ended.
    /// - `Err(KernelError)`: If the read operation failed.
    fn read(&self, data: &mut [u8]) -> Result<usize, KernelError>;
}

/// A console shared by every kernel thread.
///
/// The console device is asynchronous and accepts a single request at a time
/// in each direction. `SynchConsole` turns it into a blocking device: a
/// character operation starts the request and sleeps on a semaphore until
/// the device interrupt signals its completion. One lock per direction keeps
/// whole reads and whole writes from interleaving.
pub struct SynchConsole {
    device: Arc<Console>,
    read_avail: Arc<Semaphore>,
    write_done: Arc<Semaphore>,
    read_lock: Lock,
    write_lock: Lock,
}

impl SynchConsole {
    /// Wrap `device`, installing its interrupt handlers.
    pub fn new(device: Arc<Console>) -> Self {
        let read_avail = Arc::new(Semaphore::new("console read avail", 0));
        let write_done = Arc::new(Semaphore::new("console write done", 0));
        let (r, w) = (read_avail.clone(), write_done.clone());
        device.attach(move || r.v(), move || w.v());
        Self {
            device,
            read_avail,
            write_done,
            read_lock: Lock::new("console read"),
            write_lock: Lock::new("console write"),
        }
    }

    /// Wait for the next input character. `None` at the end of input.
    pub fn get_char(&self) -> Option<u8> {
        self.read_avail.p();
        self.device.get_char()
    }

    /// Print `c`, waiting until the device is done with it.
    pub fn put_char(&self, c: u8) {
        self.device.put_char(c);
        self.write_done.p();
    }
}

impl Teletype for SynchConsole {
    fn write(&self, data: &[u8]) -> Result<usize, KernelError> {
        self.write_lock.acquire();
        for c in data.iter() {
            self.put_char(*c);
        }
        self.write_lock.release();
        Ok(data.len())
    }

    fn read(&self, data: &mut [u8]) -> Result<usize, KernelError> {
        self.read_lock.acquire();
        let mut count = 0;
        for slot in data.iter_mut() {
            match self.get_char() {
                Some(c) => {
                    *slot = c;
                    count += 1;
                }
                None => break,
            }
        }
        self.read_lock.release();
        Ok(count)
    }
}
