//! Byte storage.
//!
//! A flat namespace of fixed-size files held in host memory. The kernel keeps
//! executable images and per-process swap files here. A file keeps the size
//! it was created with until it is resized; reads and writes are clamped to
//! it.

use crate::spinlock::SpinLock;
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;

/// Errors raised by [`Storage`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A file with that name already exists.
    #[error("file `{0}` already exists")]
    AlreadyExists(String),
    /// No file with that name exists.
    #[error("file `{0}` does not exist")]
    NotFound(String),
    /// Creating the file would exceed the capacity of the storage.
    #[error("no space left for {requested} bytes ({available} available)")]
    NoSpace {
        /// Size of the rejected file.
        requested: usize,
        /// Bytes still available.
        available: usize,
    },
}

type Bytes = Arc<SpinLock<Vec<u8>>>;

struct Inner {
    files: BTreeMap<String, Bytes>,
    used: usize,
}

/// The storage device.
pub struct Storage {
    capacity: Option<usize>,
    inner: SpinLock<Inner>,
}

impl Storage {
    /// Create an empty storage. `capacity` bounds the sum of the sizes of
    /// all files, if given.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            inner: SpinLock::new(Inner {
                files: BTreeMap::new(),
                used: 0,
            }),
        }
    }

    /// Create a zero-filled file of `size` bytes.
    pub fn create(&self, name: &str, size: usize) -> Result<(), StorageError> {
        self.insert(name, vec![0; size])
    }

    /// Create a file holding `data`.
    pub fn write_file(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.insert(name, data.to_vec())
    }

    fn insert(&self, name: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let result = if inner.files.contains_key(name) {
            Err(StorageError::AlreadyExists(name.into()))
        } else {
            let available = self
                .capacity
                .map_or(usize::MAX, |cap| cap.saturating_sub(inner.used));
            if data.len() > available {
                Err(StorageError::NoSpace {
                    requested: data.len(),
                    available,
                })
            } else {
                inner.used += data.len();
                inner
                    .files
                    .insert(name.into(), Arc::new(SpinLock::new(data)));
                Ok(())
            }
        };
        inner.unlock();
        result
    }

    /// Open the file `name`.
    pub fn open(&self, name: &str) -> Option<OpenFile> {
        let inner = self.inner.lock();
        let file = inner.files.get(name).cloned();
        inner.unlock();
        file.map(|bytes| OpenFile { bytes })
    }

    /// Remove the file `name`. Files already open stay usable.
    pub fn remove(&self, name: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let result = match inner.files.remove(name) {
            Some(bytes) => {
                let size = {
                    let b = bytes.lock();
                    let len = b.len();
                    b.unlock();
                    len
                };
                inner.used -= size;
                Ok(())
            }
            None => Err(StorageError::NotFound(name.into())),
        };
        inner.unlock();
        result
    }

    /// Grow or shrink the file `name` to `len` bytes. New bytes are zero.
    /// Handles opened before the call observe the new size.
    pub fn resize(&self, name: &str, len: usize) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let result = match inner.files.get(name).cloned() {
            Some(bytes) => {
                let mut b = bytes.lock();
                let old = b.len();
                let available = self
                    .capacity
                    .map_or(usize::MAX, |cap| cap.saturating_sub(inner.used));
                let r = if len > old && len - old > available {
                    Err(StorageError::NoSpace {
                        requested: len - old,
                        available,
                    })
                } else {
                    b.resize(len, 0);
                    inner.used = inner.used - old + len;
                    Ok(())
                };
                b.unlock();
                r
            }
            None => Err(StorageError::NotFound(name.into())),
        };
        inner.unlock();
        result
    }

    /// Returns true if the file `name` exists.
    pub fn exists(&self, name: &str) -> bool {
        let inner = self.inner.lock();
        let exists = inner.files.contains_key(name);
        inner.unlock();
        exists
    }
}

/// A handle to a file of [`Storage`].
#[derive(Clone)]
pub struct OpenFile {
    bytes: Bytes,
}

impl OpenFile {
    /// Size of the file in bytes.
    pub fn len(&self) -> usize {
        let bytes = self.bytes.lock();
        let len = bytes.len();
        bytes.unlock();
        len
    }

    /// Returns true if the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read into `buf` from `position`, returning the number of bytes read.
    pub fn read_at(&self, position: usize, buf: &mut [u8]) -> usize {
        let bytes = self.bytes.lock();
        let n = bytes.len().saturating_sub(position).min(buf.len());
        if n > 0 {
            buf[..n].copy_from_slice(&bytes[position..position + n]);
        }
        bytes.unlock();
        n
    }

    /// Write `data` at `position`, returning the number of bytes written.
    pub fn write_at(&self, position: usize, data: &[u8]) -> usize {
        let mut bytes = self.bytes.lock();
        let n = bytes.len().saturating_sub(position).min(data.len());
        if n > 0 {
            bytes[position..position + n].copy_from_slice(&data[..n]);
        }
        bytes.unlock();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_remove() {
        let storage = Storage::new(None);
        storage.create("swap.0", 16).unwrap();
        assert!(storage.exists("swap.0"));
        assert_eq!(
            storage.create("swap.0", 4),
            Err(StorageError::AlreadyExists("swap.0".into()))
        );

        let file = storage.open("swap.0").unwrap();
        assert_eq!(file.len(), 16);
        storage.remove("swap.0").unwrap();
        assert!(storage.open("swap.0").is_none());
        assert!(storage.remove("swap.0").is_err());
        // The handle outlives the name.
        assert_eq!(file.write_at(0, b"abc"), 3);
    }

    #[test]
    fn io_is_clamped_to_size() {
        let storage = Storage::new(None);
        storage.write_file("halt", b"0123456789").unwrap();
        let file = storage.open("halt").unwrap();

        let mut buf = [0; 4];
        assert_eq!(file.read_at(8, &mut buf), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(file.read_at(12, &mut buf), 0);
        assert_eq!(file.write_at(9, b"xy"), 1);
        assert_eq!(file.read_at(6, &mut buf), 4);
        assert_eq!(&buf, b"678x");
    }

    #[test]
    fn capacity() {
        let storage = Storage::new(Some(10));
        storage.create("a", 6).unwrap();
        assert_eq!(
            storage.create("b", 6),
            Err(StorageError::NoSpace {
                requested: 6,
                available: 4
            })
        );
        storage.remove("a").unwrap();
        storage.create("b", 6).unwrap();
    }

    #[test]
    fn resize_respects_capacity() {
        let storage = Storage::new(Some(8));
        storage.create("swap.1", 4).unwrap();
        let file = storage.open("swap.1").unwrap();
        storage.resize("swap.1", 8).unwrap();
        assert_eq!(file.len(), 8);
        assert!(storage.resize("swap.1", 9).is_err());
        storage.resize("swap.1", 2).unwrap();
        storage.create("b", 6).unwrap();
        assert_eq!(
            storage.resize("c", 1),
            Err(StorageError::NotFound("c".into()))
        );
    }
}
