//! Pipes.
//!
//! A pipe is a bounded byte queue between two processes. The writer blocks
//! while the pipe is full and the reader blocks while it is empty. Closing
//! one end wakes the other: a reader drains what is left and then sees the
//! end of the stream, and a writer whose reader is gone gets
//! [`KernelError::BrokenPipe`].

use crate::{
    KernelError,
    sync::{Condition, Lock},
    teletype::Teletype,
};
use machine::spinlock::SpinLock;
use std::collections::VecDeque;

struct State {
    buffer: VecDeque<u8>,
    reader_open: bool,
    writer_open: bool,
}

/// A one-way byte channel.
pub struct Pipe {
    capacity: usize,
    lock: Lock,
    changed: Condition,
    state: SpinLock<State>,
}

impl Pipe {
    /// Create an empty pipe holding up to `capacity` bytes, both ends open.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Pipe of capacity 0.");
        Self {
            capacity,
            lock: Lock::new("pipe"),
            changed: Condition::new("pipe changed"),
            state: SpinLock::new(State {
                buffer: VecDeque::with_capacity(capacity),
                reader_open: true,
                writer_open: true,
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        state.unlock();
        result
    }

    /// Append `byte`, waiting for room.
    ///
    /// # Errors
    /// [`KernelError::BrokenPipe`] if the read end is closed.
    pub fn write_byte(&self, byte: u8) -> Result<(), KernelError> {
        self.lock.acquire();
        let result = loop {
            let (full, reader_open) =
                self.with_state(|s| (s.buffer.len() == self.capacity, s.reader_open));
            if !reader_open {
                break Err(KernelError::BrokenPipe);
            }
            if !full {
                self.with_state(|s| s.buffer.push_back(byte));
                self.changed.broadcast(&self.lock);
                break Ok(());
            }
            self.changed.wait(&self.lock);
        };
        self.lock.release();
        result
    }

    /// Take the oldest byte, waiting for one.
    ///
    /// Returns `None` once the pipe is empty and the write end is closed.
    pub fn read_byte(&self) -> Option<u8> {
        self.lock.acquire();
        let byte = loop {
            let (byte, writer_open) = self.with_state(|s| (s.buffer.pop_front(), s.writer_open));
            if byte.is_some() {
                self.changed.broadcast(&self.lock);
                break byte;
            }
            if !writer_open {
                break None;
            }
            self.changed.wait(&self.lock);
        };
        self.lock.release();
        byte
    }

    /// Close the read end.
    pub fn close_read(&self) {
        self.lock.acquire();
        self.with_state(|s| s.reader_open = false);
        self.changed.broadcast(&self.lock);
        self.lock.release();
    }

    /// Close the write end.
    pub fn close_write(&self) {
        self.lock.acquire();
        self.with_state(|s| s.writer_open = false);
        self.changed.broadcast(&self.lock);
        self.lock.release();
    }

    /// Number of bytes waiting to be read.
    pub fn len(&self) -> usize {
        self.with_state(|s| s.buffer.len())
    }

    /// Returns true if no byte is waiting to be read.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of bytes the pipe holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Teletype for Pipe {
    fn write(&self, data: &[u8]) -> Result<usize, KernelError> {
        let mut count = 0;
        for byte in data.iter() {
            match self.write_byte(*byte) {
                Ok(()) => count += 1,
                Err(e) if count == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(count)
    }

    fn read(&self, data: &mut [u8]) -> Result<usize, KernelError> {
        let mut count = 0;
        for slot in data.iter_mut() {
            match self.read_byte() {
                Some(byte) => {
                    *slot = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}
