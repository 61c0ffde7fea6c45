//! File abstraction and binary stream primitives.
//!
//! This module is the boundary between the runtime and the operating system:
//! it maps input files into memory, hands out bounded readers over file
//! sub-ranges, and manages the writable mapping that the parallel write
//! pipeline partitions into per-task windows.
//!
//! # Key Components
//!
//! - [`FileInput`] - Read side: a mapped (or in-memory) SKilL file
//! - [`Backend`] - Trait for pluggable input data sources
//! - [`FileOutput`] - Write side: a sized, writable mapping of the target file
//! - [`MapReader`] - Bounded big-endian reader incl. v64
//! - [`MapWriter`] / [`OutBuffer`] - Bounded and growable write sinks
//!
//! # Thread Safety
//!
//! [`FileInput`] is immutable after creation and shared freely across the
//! decode workers; the string pool serializes its lazy reads on its own
//! mutex. [`FileOutput`] is partitioned into non-overlapping mutable windows
//! before any worker touches it.

pub mod reader;
pub mod writer;

pub use reader::MapReader;
pub use writer::{v64_offset, BinaryOut, MapWriter, OutBuffer};

use std::fs;
use std::path::Path;

use memmap2::{Mmap, MmapMut};

use crate::{Error::OutOfBounds, Result};

/// Backend trait for input data sources.
///
/// Implemented by the memory-mapped disk backend and the in-memory backend
/// used for freshly created states and tests.
pub trait Backend: Send + Sync {
    /// Borrow the full backing data.
    fn data(&self) -> &[u8];

    /// Length of the backing data in bytes.
    fn len(&self) -> usize;

    /// Returns true if the backing data is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Input file backed by a physical file on disk.
pub struct Physical {
    data: Mmap,
}

impl Physical {
    /// Map a file from disk.
    ///
    /// # Errors
    /// Returns [`Error::FileError`](crate::Error::FileError) if the file can
    /// not be opened, [`Error::Empty`](crate::Error::Empty) if it has no
    /// content, or a mapping failure wrapped as
    /// [`Error::Internal`](crate::Error::Internal).
    pub fn new(path: &Path) -> Result<Physical> {
        let file = fs::File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(crate::Error::Empty);
        }

        let mmap = match unsafe { Mmap::map(&file) } {
            Ok(mmap) => mmap,
            Err(error) => return Err(crate::Error::Internal(error.to_string())),
        };

        Ok(Physical { data: mmap })
    }
}

impl Backend for Physical {
    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Input backed by an owned in-memory buffer.
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Create a new memory backend consuming the given buffer.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Memory {
        Memory { data }
    }
}

impl Backend for Memory {
    fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// The read side of a SKilL file.
///
/// Wraps a [`Backend`] and hands out [`MapReader`]s over bounded sub-ranges.
/// Field decoders each map the byte range of their chunk; the string pool
/// maps individual string runs on demand.
pub struct FileInput {
    backend: Box<dyn Backend>,
}

impl FileInput {
    /// Map a file from disk.
    ///
    /// # Errors
    /// See [`Physical::new`].
    pub fn open(path: &Path) -> Result<FileInput> {
        Ok(FileInput {
            backend: Box::new(Physical::new(path)?),
        })
    }

    /// Use an in-memory buffer as input.
    #[must_use]
    pub fn from_buffer(data: Vec<u8>) -> FileInput {
        FileInput {
            backend: Box::new(Memory::new(data)),
        }
    }

    /// Input of a freshly created state: no bytes at all.
    #[must_use]
    pub fn empty() -> FileInput {
        FileInput::from_buffer(Vec::new())
    }

    /// Total length of the input in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backend.len()
    }

    /// Returns true if the input holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
    }

    /// Borrow the full input data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.backend.data()
    }

    /// Produce a bounded reader over the absolute byte range `[begin, end)`.
    ///
    /// # Errors
    /// Returns [`OutOfBounds`] if the range does not lie within the input.
    pub fn map(&self, begin: u64, end: u64) -> Result<MapReader<'_>> {
        let data = self.backend.data();
        let (begin, end) = (begin as usize, end as usize);
        if begin > end || end > data.len() {
            return Err(OutOfBounds);
        }
        Ok(MapReader::new(&data[begin..end]))
    }

    /// Borrow `len` bytes at the absolute offset `off`.
    ///
    /// # Errors
    /// Returns [`OutOfBounds`] if the span does not lie within the input.
    pub fn read_at(&self, off: u64, len: usize) -> Result<&[u8]> {
        let data = self.backend.data();
        let off = off as usize;
        let end = off.checked_add(len).ok_or(OutOfBounds)?;
        if end > data.len() {
            return Err(OutOfBounds);
        }
        Ok(&data[off..end])
    }
}

/// The write side: a writable mapping of the target file at its final size.
///
/// For a full rewrite the file is created and truncated; for an append the
/// existing file is grown and the whole file is remapped, with writes
/// confined to the appended region. The total size must be known up front,
/// which is exactly what the offset phase computes.
pub struct FileOutput {
    mmap: MmapMut,
    /// Absolute offset at which this operation's writable region begins.
    base: u64,
}

impl FileOutput {
    fn map_writable(file: &fs::File) -> Result<MmapMut> {
        match unsafe { MmapMut::map_mut(file) } {
            Ok(mmap) => Ok(mmap),
            Err(error) => Err(crate::Error::Internal(error.to_string())),
        }
    }

    /// Create (or truncate) the target file with exactly `size` bytes.
    ///
    /// # Errors
    /// Returns [`Error::FileError`](crate::Error::FileError) if creation or
    /// sizing fails, or a mapping failure wrapped as
    /// [`Error::Internal`](crate::Error::Internal).
    pub fn create(path: &Path, size: u64) -> Result<FileOutput> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;

        Ok(FileOutput {
            mmap: Self::map_writable(&file)?,
            base: 0,
        })
    }

    /// Grow the target file by `additional` bytes and map it.
    ///
    /// The writable region starts at the previous end of the file, which is
    /// returned by [`FileOutput::base`].
    ///
    /// # Errors
    /// Returns [`Error::FileError`](crate::Error::FileError) if the file can
    /// not be opened or grown, or a mapping failure wrapped as
    /// [`Error::Internal`](crate::Error::Internal).
    pub fn append(path: &Path, additional: u64) -> Result<FileOutput> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let base = file.metadata()?.len();
        file.set_len(base + additional)?;

        Ok(FileOutput {
            mmap: Self::map_writable(&file)?,
            base,
        })
    }

    /// Absolute offset at which this operation's writable region begins.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Mutable view of this operation's writable region.
    #[must_use]
    pub fn region(&mut self) -> &mut [u8] {
        let base = self.base as usize;
        &mut self.mmap[base..]
    }

    /// Flush the mapping to disk and close it.
    ///
    /// # Errors
    /// Returns [`Error::FileError`](crate::Error::FileError) if the flush
    /// fails.
    pub fn finish(self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_input_bounds() {
        let input = FileInput::from_buffer(vec![1, 2, 3, 4]);
        assert_eq!(input.len(), 4);
        assert_eq!(input.read_at(1, 2).unwrap(), &[2, 3]);
        assert!(input.read_at(3, 2).is_err());

        let mut r = input.map(2, 4).unwrap();
        assert_eq!(r.i8().unwrap(), 3);
        assert!(input.map(3, 2).is_err());
        assert!(input.map(0, 5).is_err());
    }

    #[test]
    fn output_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sf");

        let mut out = FileOutput::create(&path, 4).unwrap();
        out.region().copy_from_slice(&[9, 8, 7, 6]);
        out.finish().unwrap();

        let mut out = FileOutput::append(&path, 2).unwrap();
        assert_eq!(out.base(), 4);
        out.region().copy_from_slice(&[5, 4]);
        out.finish().unwrap();

        let input = FileInput::open(&path).unwrap();
        assert_eq!(input.data(), &[9, 8, 7, 6, 5, 4]);
    }
}
