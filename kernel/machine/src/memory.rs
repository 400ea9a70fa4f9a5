//! Main memory of the machine.

use crate::{
    addressing::{PAGE_SIZE, Pa},
    spinlock::SpinLock,
};

/// Physical memory, a flat array of `num_frames * PAGE_SIZE` bytes.
pub struct MainMemory {
    num_frames: usize,
    bytes: SpinLock<Vec<u8>>,
}

impl MainMemory {
    /// Create a zero-filled memory of `num_frames` frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            num_frames,
            bytes: SpinLock::new(vec![0; num_frames * PAGE_SIZE]),
        }
    }

    /// The number of physical frames.
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Copy `buf.len()` bytes starting at `pa` into `buf`.
    ///
    /// # Panics
    /// Panics if the range exceeds the memory. The MMU never produces such
    /// an address.
    pub fn read(&self, pa: Pa, buf: &mut [u8]) {
        let start = pa.into_usize();
        let bytes = self.bytes.lock();
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        bytes.unlock();
    }

    /// Copy `data` into memory starting at `pa`.
    ///
    /// # Panics
    /// Panics if the range exceeds the memory.
    pub fn write(&self, pa: Pa, data: &[u8]) {
        let start = pa.into_usize();
        let mut bytes = self.bytes.lock();
        bytes[start..start + data.len()].copy_from_slice(data);
        bytes.unlock();
    }

    /// Fill frame `frame` with zeroes.
    pub fn zero_frame(&self, frame: usize) {
        let start = Pa::from_frame(frame).into_usize();
        let mut bytes = self.bytes.lock();
        bytes[start..start + PAGE_SIZE].fill(0);
        bytes.unlock();
    }

    /// A copy of the content of frame `frame`.
    pub fn read_frame(&self, frame: usize) -> [u8; PAGE_SIZE] {
        let mut page = [0; PAGE_SIZE];
        self.read(Pa::from_frame(frame), &mut page);
        page
    }
}
