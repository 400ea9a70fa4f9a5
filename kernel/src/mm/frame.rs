//! Physical frame allocator.

use crate::sync::Lock;
use bitvec::prelude::*;
use machine::spinlock::SpinLock;

/// Hands out the physical frames of main memory.
///
/// A bitmap with one bit per frame, set while the frame is in use. The
/// allocator always picks the lowest free frame.
pub struct FrameAllocator {
    lock: Lock,
    frames: SpinLock<BitVec>,
}

impl FrameAllocator {
    /// Create an allocator for `num_frames` frames, all free.
    pub fn new(num_frames: usize) -> Self {
        Self {
            lock: Lock::new("frame allocator"),
            frames: SpinLock::new(bitvec![0; num_frames]),
        }
    }

    fn with_frames<R>(&self, f: impl FnOnce(&mut BitVec) -> R) -> R {
        self.lock.acquire();
        let mut frames = self.frames.lock();
        let result = f(&mut frames);
        frames.unlock();
        self.lock.release();
        result
    }

    /// Take the lowest free frame.
    pub fn allocate(&self) -> Option<usize> {
        self.with_frames(|frames| {
            let frame = frames.first_zero()?;
            frames.set(frame, true);
            Some(frame)
        })
    }

    /// Give `frame` back.
    ///
    /// # Panics
    /// Panics if `frame` is not allocated.
    pub fn free(&self, frame: usize) {
        let was_allocated = self.with_frames(|frames| frames.replace(frame, false));
        assert!(was_allocated, "Frame {frame} freed while not allocated.");
    }

    /// Returns true if `frame` is in use at the time of the call.
    pub fn is_allocated(&self, frame: usize) -> bool {
        self.with_frames(|frames| frames.get(frame).is_some_and(|bit| *bit))
    }

    /// Number of free frames.
    pub fn free_count(&self) -> usize {
        self.with_frames(|frames| frames.count_zeros())
    }

    /// Total number of frames.
    pub fn capacity(&self) -> usize {
        self.with_frames(|frames| frames.len())
    }
}
