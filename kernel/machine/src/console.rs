//! Console device.
//!
//! The console is an asynchronous character device. Input comes from a byte
//! buffer preloaded by the host and output is captured for inspection.
//!
//! Reading is interrupt driven: after [`Console::attach`], the device raises
//! the read-available interrupt once a character (or the end of input) can
//! be taken with [`Console::get_char`]. Taking it arms the next one.
//! [`Console::put_char`] starts printing a character; the write-done
//! interrupt is raised once the device is ready for the next one. Only one
//! character may be in flight in each direction.

use crate::{
    cpu::Cpu,
    interrupt::{CONSOLE_TIME, InterruptKind},
    spinlock::SpinLock,
    stats::Statistics,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};

type Handler = Arc<dyn Fn() + Send + Sync>;

struct Handlers {
    read_avail: Handler,
    write_done: Handler,
}

#[derive(Default)]
struct State {
    input: VecDeque<u8>,
    // `Some(None)` is the end of input.
    incoming: Option<Option<u8>>,
    output: Vec<u8>,
    busy: bool,
    handlers: Option<Handlers>,
}

/// The console device.
pub struct Console {
    cpu: Arc<Cpu>,
    stats: Arc<Statistics>,
    echo: bool,
    state: SpinLock<State>,
}

impl Console {
    /// Create a console whose input is `input`. With `echo`, every character
    /// read is copied to the output.
    pub fn new(cpu: Arc<Cpu>, stats: Arc<Statistics>, input: &[u8], echo: bool) -> Arc<Self> {
        Arc::new(Self {
            cpu,
            stats,
            echo,
            state: SpinLock::new(State {
                input: input.iter().copied().collect(),
                ..Default::default()
            }),
        })
    }

    /// Install the interrupt handlers and start polling for input.
    pub fn attach(
        self: &Arc<Self>,
        read_avail: impl Fn() + Send + Sync + 'static,
        write_done: impl Fn() + Send + Sync + 'static,
    ) {
        let mut state = self.state.lock();
        state.handlers = Some(Handlers {
            read_avail: Arc::new(read_avail),
            write_done: Arc::new(write_done),
        });
        state.unlock();
        self.schedule_poll();
    }

    fn schedule_poll(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        self.cpu
            .interrupt
            .schedule(CONSOLE_TIME, InterruptKind::ConsoleRead, move || {
                if let Some(this) = Weak::upgrade(&this) {
                    this.poll();
                }
            });
    }

    fn poll(&self) {
        let mut state = self.state.lock();
        if state.incoming.is_none() {
            let next = state.input.pop_front();
            state.incoming = Some(next);
        }
        let handler = state.handlers.as_ref().map(|h| h.read_avail.clone());
        state.unlock();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Take the character announced by the last read-available interrupt.
    ///
    /// # Returns
    /// - `Some(c)`: the next input character.
    /// - `None`: the input is exhausted.
    ///
    /// # Panics
    /// Panics if no read-available interrupt is outstanding.
    pub fn get_char(self: &Arc<Self>) -> Option<u8> {
        let mut state = self.state.lock();
        let incoming = state.incoming.take();
        let Some(ch) = incoming else {
            state.unlock();
            panic!("Console::get_char() without a pending character");
        };
        if let Some(c) = ch {
            Statistics::bump(&self.stats.console_chars_read);
            if self.echo {
                state.output.push(c);
            }
        }
        state.unlock();
        self.schedule_poll();
        ch
    }

    /// Start printing `c`.
    ///
    /// # Panics
    /// Panics if the previous character is still being printed.
    pub fn put_char(self: &Arc<Self>, c: u8) {
        let mut state = self.state.lock();
        if state.busy {
            state.unlock();
            panic!("Console::put_char() while the device is busy");
        }
        state.busy = true;
        state.output.push(c);
        state.unlock();
        Statistics::bump(&self.stats.console_chars_written);

        let this = Arc::downgrade(self);
        self.cpu
            .interrupt
            .schedule(CONSOLE_TIME, InterruptKind::ConsoleWrite, move || {
                if let Some(this) = Weak::upgrade(&this) {
                    this.write_done();
                }
            });
    }

    fn write_done(&self) {
        let mut state = self.state.lock();
        state.busy = false;
        let handler = state.handlers.as_ref().map(|h| h.write_done.clone());
        state.unlock();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Everything printed so far.
    pub fn output(&self) -> Vec<u8> {
        let state = self.state.lock();
        let output = state.output.clone();
        state.unlock();
        output
    }

    /// Everything printed so far, lossily decoded.
    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output()).into_owned()
    }
}
