//! Priority ordered queue of blocked threads.

use crate::thread::Thread;
use machine::spinlock::SpinLock;
use std::{
    cmp::Reverse,
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

/// A queue of threads waiting on a synchronization primitive.
///
/// Threads are kept sorted by descending priority; threads of equal priority
/// keep their arrival order. The priority of a thread is sampled when it is
/// enqueued.
pub struct WaitQueue {
    waiters: SpinLock<BTreeMap<(Reverse<i32>, u64), Arc<Thread>>>,
    seq: AtomicU64,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    /// Create an empty queue.
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Insert `th` behind every waiter of higher or equal priority.
    pub fn push(&self, th: Arc<Thread>) {
        let key = (
            Reverse(th.priority()),
            self.seq.fetch_add(1, Ordering::Relaxed),
        );
        let mut waiters = self.waiters.lock();
        waiters.insert(key, th);
        waiters.unlock();
    }

    /// Remove the most urgent waiter.
    pub fn pop(&self) -> Option<Arc<Thread>> {
        let mut waiters = self.waiters.lock();
        let th = waiters.pop_first().map(|(_, th)| th);
        waiters.unlock();
        th
    }

    /// Returns true if nobody waits.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of waiters.
    pub fn len(&self) -> usize {
        let waiters = self.waiters.lock();
        let len = waiters.len();
        waiters.unlock();
        len
    }
}
