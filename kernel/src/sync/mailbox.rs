use super::{Condition, Lock};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

/// A rendezvous point that passes one integer at a time.
///
/// [`Mailbox::send`] waits until a receiver has arrived and the slot is
/// free; [`Mailbox::receive`] waits until a message is in the slot. Each
/// message is received exactly once.
pub struct Mailbox {
    lock: Lock,
    senders: Condition,
    receivers: Condition,
    // Protected by `lock`.
    slot: AtomicI32,
    full: AtomicBool,
    waiting_receivers: AtomicUsize,
}

impl Mailbox {
    /// Create an empty mailbox.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            lock: Lock::new(format!("{name} lock")),
            senders: Condition::new(format!("{name} senders")),
            receivers: Condition::new(format!("{name} receivers")),
            slot: AtomicI32::new(0),
            full: AtomicBool::new(false),
            waiting_receivers: AtomicUsize::new(0),
        }
    }

    /// Deliver `message` to some receiver.
    ///
    /// Returns once the message is in the slot; the receiver may not have
    /// taken it yet.
    pub fn send(&self, message: i32) {
        self.lock.acquire();
        while self.full.load(Ordering::SeqCst)
            || self.waiting_receivers.load(Ordering::SeqCst) == 0
        {
            self.senders.wait(&self.lock);
        }
        self.slot.store(message, Ordering::SeqCst);
        self.full.store(true, Ordering::SeqCst);
        self.receivers.signal(&self.lock);
        self.lock.release();
    }

    /// Wait for a message.
    pub fn receive(&self) -> i32 {
        self.lock.acquire();
        self.waiting_receivers.fetch_add(1, Ordering::SeqCst);
        self.senders.signal(&self.lock);
        while !self.full.load(Ordering::SeqCst) {
            self.receivers.wait(&self.lock);
        }
        let message = self.slot.swap(0, Ordering::SeqCst);
        self.full.store(false, Ordering::SeqCst);
        self.waiting_receivers.fetch_sub(1, Ordering::SeqCst);
        // A sender may be waiting for the slot to drain.
        self.senders.signal(&self.lock);
        self.lock.release();
        message
    }
}
