//! Utility to parse NOFF executables.
//!
//! A NOFF ("Nachos Object File Format") image is a fixed 40-byte header
//! followed by the bytes of the segments it describes. The header is a magic
//! number and three segment descriptors, each made of three 32-bit words:
//!
//! ```text
//! +-------+------------------+------------------+------------------+
//! | magic |      code        |    initData      |   uninitData     |
//! |       | vaddr infile size| vaddr infile size| vaddr infile size|
//! +-------+------------------+------------------+------------------+
//! ```
//!
//! Words are little-endian. An image whose words are all byte-swapped is
//! accepted too: its magic reads as the byte-swapped [`NOFF_MAGIC`].
//!
//! The `uninitData` segment has no bytes in the file; it is zero-filled on
//! demand.

use crate::KernelError;
use machine::storage::OpenFile;

/// The magic number at the beginning of every NOFF image.
pub const NOFF_MAGIC: u32 = 0x00ba_dfad;

/// One segment of a NOFF image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    /// Where the segment starts in the address space.
    pub virtual_addr: u32,
    /// Where the segment's bytes start in the image.
    pub in_file_addr: u32,
    /// Size of the segment in bytes.
    pub size: u32,
}

impl Segment {
    /// The part of `[addr, addr + len)` covered by this segment.
    pub fn overlap(&self, addr: usize, len: usize) -> Option<(usize, usize)> {
        if self.size == 0 {
            return None;
        }
        let start = addr.max(self.virtual_addr as usize);
        let end = (addr + len).min(self.virtual_addr as usize + self.size as usize);
        (start < end).then_some((start, end))
    }

    fn to_words(self) -> [u32; 3] {
        [self.virtual_addr, self.in_file_addr, self.size]
    }
}

/// The header of a NOFF image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoffHeader {
    /// Program text.
    pub code: Segment,
    /// Initialized data.
    pub init_data: Segment,
    /// Zero-initialized data.
    pub uninit_data: Segment,
}

impl NoffHeader {
    /// Size of an encoded header.
    pub const SIZE: usize = 40;

    /// Decode a header.
    ///
    /// # Errors
    /// [`KernelError::NoExec`] if `bytes` is too short or the magic number is
    /// wrong in both byte orders.
    pub fn parse(bytes: &[u8]) -> Result<Self, KernelError> {
        let bytes = bytes.get(..Self::SIZE).ok_or(KernelError::NoExec)?;
        let mut words = [0u32; 10];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        if words[0] != NOFF_MAGIC && words[0].swap_bytes() == NOFF_MAGIC {
            words.iter_mut().for_each(|w| *w = w.swap_bytes());
        }
        if words[0] != NOFF_MAGIC {
            return Err(KernelError::NoExec);
        }
        let segment = |i: usize| Segment {
            virtual_addr: words[i],
            in_file_addr: words[i + 1],
            size: words[i + 2],
        };
        Ok(Self {
            code: segment(1),
            init_data: segment(4),
            uninit_data: segment(7),
        })
    }

    /// Read and decode the header of `file`, and check it against the file.
    ///
    /// # Errors
    /// [`KernelError::NoExec`] if the header cannot be decoded or fails
    /// [`NoffHeader::validate`].
    pub fn read_from(file: &OpenFile) -> Result<Self, KernelError> {
        let mut bytes = [0; Self::SIZE];
        if file.read_at(0, &mut bytes) != Self::SIZE {
            return Err(KernelError::NoExec);
        }
        let header = Self::parse(&bytes)?;
        header.validate(file.len())?;
        Ok(header)
    }

    /// Check the segment descriptors of an image of `file_len` bytes.
    ///
    /// The bytes of the code and initialized data must lie inside the image,
    /// and every segment must lie inside the first [`image_size`] bytes of
    /// the address space.
    ///
    /// [`image_size`]: NoffHeader::image_size
    pub fn validate(&self, file_len: usize) -> Result<(), KernelError> {
        let fits = |start: u32, size: u32, limit: usize| {
            size == 0
                || matches!(
                    (start as usize).checked_add(size as usize),
                    Some(end) if end <= limit
                )
        };
        let in_file = [self.code, self.init_data]
            .iter()
            .all(|seg| fits(seg.in_file_addr, seg.size, file_len));
        let in_space = [self.code, self.init_data, self.uninit_data]
            .iter()
            .all(|seg| fits(seg.virtual_addr, seg.size, self.image_size()));
        if in_file && in_space {
            Ok(())
        } else {
            Err(KernelError::NoExec)
        }
    }

    /// Encode the header, little-endian.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        let words = [NOFF_MAGIC]
            .into_iter()
            .chain(self.code.to_words())
            .chain(self.init_data.to_words())
            .chain(self.uninit_data.to_words());
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Bytes of the address space the segments need.
    pub fn image_size(&self) -> usize {
        self.code.size as usize + self.init_data.size as usize + self.uninit_data.size as usize
    }
}

/// Assemble NOFF images.
///
/// The code segment starts at virtual address 0, the initialized data
/// follows it, and the uninitialized data follows that.
///
/// ```rust
/// use kernel::mm::noff::{ImageBuilder, NoffHeader};
///
/// let image = ImageBuilder::new()
///     .code(b"text")
///     .init_data(b"data")
///     .uninit_data(16)
///     .build();
/// let header = NoffHeader::parse(&image).unwrap();
/// assert_eq!(header.init_data.virtual_addr, 4);
/// assert_eq!(header.image_size(), 24);
/// ```
#[derive(Default)]
pub struct ImageBuilder {
    code: Vec<u8>,
    init_data: Vec<u8>,
    uninit_size: u32,
    byte_swapped: bool,
}

impl ImageBuilder {
    /// Start an image with empty segments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the content of the code segment.
    pub fn code(mut self, code: &[u8]) -> Self {
        self.code = code.to_vec();
        self
    }

    /// Sets the content of the initialized data segment.
    pub fn init_data(mut self, data: &[u8]) -> Self {
        self.init_data = data.to_vec();
        self
    }

    /// Sets the size of the uninitialized data segment.
    pub fn uninit_data(mut self, size: u32) -> Self {
        self.uninit_size = size;
        self
    }

    /// Encode the header in the opposite byte order.
    pub fn byte_swapped(mut self, swapped: bool) -> Self {
        self.byte_swapped = swapped;
        self
    }

    /// Produce the image.
    pub fn build(self) -> Vec<u8> {
        let code_len = self.code.len() as u32;
        let data_len = self.init_data.len() as u32;
        let header = NoffHeader {
            code: Segment {
                virtual_addr: 0,
                in_file_addr: NoffHeader::SIZE as u32,
                size: code_len,
            },
            init_data: Segment {
                virtual_addr: code_len,
                in_file_addr: NoffHeader::SIZE as u32 + code_len,
                size: data_len,
            },
            uninit_data: Segment {
                virtual_addr: code_len + data_len,
                in_file_addr: 0,
                size: self.uninit_size,
            },
        };
        let mut header = header.to_bytes();
        if self.byte_swapped {
            header.chunks_exact_mut(4).for_each(|w| w.reverse());
        }

        let mut image = header.to_vec();
        image.extend_from_slice(&self.code);
        image.extend_from_slice(&self.init_data);
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_built_image() {
        let image = ImageBuilder::new()
            .code(&[0xaa; 200])
            .init_data(&[0xbb; 10])
            .uninit_data(50)
            .build();
        assert_eq!(image.len(), NoffHeader::SIZE + 210);

        let header = NoffHeader::parse(&image).unwrap();
        assert_eq!(
            header.code,
            Segment {
                virtual_addr: 0,
                in_file_addr: 40,
                size: 200
            }
        );
        assert_eq!(header.init_data.virtual_addr, 200);
        assert_eq!(header.init_data.in_file_addr, 240);
        assert_eq!(header.uninit_data.size, 50);
        assert_eq!(header.image_size(), 260);
    }

    #[test]
    fn byte_swapped_header_is_accepted() {
        let plain = ImageBuilder::new().code(b"abcd").build();
        let swapped = ImageBuilder::new().code(b"abcd").byte_swapped(true).build();
        assert_ne!(plain[..4], swapped[..4]);
        assert_eq!(
            NoffHeader::parse(&plain).unwrap(),
            NoffHeader::parse(&swapped).unwrap()
        );
    }

    #[test]
    fn bad_headers_are_rejected() {
        assert_eq!(NoffHeader::parse(b"short"), Err(KernelError::NoExec));
        let mut image = ImageBuilder::new().code(b"abcd").build();
        image[0] ^= 0xff;
        assert_eq!(NoffHeader::parse(&image), Err(KernelError::NoExec));
    }

    #[test]
    fn inconsistent_segments_are_rejected() {
        let image = ImageBuilder::new()
            .code(&[0xaa; 16])
            .init_data(&[0xbb; 8])
            .uninit_data(32)
            .build();
        let header = NoffHeader::parse(&image).unwrap();
        assert_eq!(header.validate(image.len()), Ok(()));
        // Truncated image.
        assert_eq!(header.validate(image.len() - 1), Err(KernelError::NoExec));

        let mut past_end = header;
        past_end.code.in_file_addr = 10_000;
        assert_eq!(past_end.validate(image.len()), Err(KernelError::NoExec));

        let mut wrapping = header;
        wrapping.init_data.in_file_addr = u32::MAX;
        assert_eq!(wrapping.validate(image.len()), Err(KernelError::NoExec));

        let mut far = header;
        far.init_data.virtual_addr = 0x10_0000;
        assert_eq!(far.validate(image.len()), Err(KernelError::NoExec));

        let mut overlapping = header;
        overlapping.uninit_data.virtual_addr = 40;
        assert_eq!(overlapping.validate(image.len()), Err(KernelError::NoExec));

        // An empty segment may sit anywhere.
        let image = ImageBuilder::new().code(b"abcd").build();
        let mut header = NoffHeader::parse(&image).unwrap();
        header.init_data.virtual_addr = u32::MAX;
        assert_eq!(header.validate(image.len()), Ok(()));
    }

    #[test]
    fn segment_overlap() {
        let seg = Segment {
            virtual_addr: 100,
            in_file_addr: 40,
            size: 50,
        };
        assert_eq!(seg.overlap(0, 128), Some((100, 128)));
        assert_eq!(seg.overlap(128, 128), Some((128, 150)));
        assert_eq!(seg.overlap(256, 128), None);
        assert_eq!(Segment::default().overlap(0, 128), None);
    }
}
