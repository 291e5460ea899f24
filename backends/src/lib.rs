// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::io;

use bitflags::bitflags;

mod file;
mod ram;
mod size;

pub use file::FileBackend;
pub use ram::RamBackend;
pub use size::{parse_size, ParseSizeError};

/// The possible errors a backend operation can report.
#[derive(Debug)]
pub enum Error {
    /// The requested range starts outside the backend.
    OutOfRange { offset: u64, size: u64 },

    /// The operation is not in this backend's capability set.
    Unsupported,

    /// Errors returned by I/O failures in the underlying store.
    Io(io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OutOfRange { offset, size } => {
                write!(f, "offset {offset} is out of range for a {size}-byte backend")
            }
            Self::Unsupported => write!(f, "operation not supported by this backend"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

bitflags! {
    /// Optional operations a backend may implement beyond reads and writes.
    /// A backend advertises its set once; callers are expected to check it at
    /// setup time rather than probing with trial calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const FLUSH = 1 << 0;
        const DISCARD = 1 << 1;
        const WRITE_ZEROES = 1 << 2;
        const SYNC = 1 << 3;
    }
}

/// A pluggable storage backend served as a block device.
///
/// Offsets and lengths are byte-granular. The size reported at registration
/// is fixed for the backend's lifetime; reads past it are truncated and
/// writes starting past it are rejected, so the device layer never has to
/// second-guess the backend's bounds.
pub trait Backend: Send + Sync {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// The optional operations this backend implements.
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read, which is short iff the range spans
    /// the end of the backend. A read starting at or past the end returns 0.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes written, truncated to the in-range
    /// portion if the range spans the end. A write starting at or past the
    /// end fails with `OutOfRange`.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Flush volatile state to stable storage.
    fn flush(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Release the given range; subsequent reads of it return zeroes.
    fn discard(&self, _offset: u64, _len: u64) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Zero the given range.
    fn write_zeroes(&self, _offset: u64, _len: u64) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Synchronize all state, including metadata.
    fn sync(&self) -> Result<()> {
        Err(Error::Unsupported)
    }
}

/// Clamp a byte range against `size`, for operations that truncate at the
/// boundary. Returns the usable length, which is 0 when `offset` is at or
/// past the end.
pub(crate) fn clamp_range(offset: u64, len: usize, size: u64) -> usize {
    if offset >= size {
        return 0;
    }
    let available = size - offset;
    len.min(available.try_into().unwrap_or(usize::MAX))
}
