// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::{clamp_range, Backend, Capabilities, Error, Result};

/// A file-backed store using positional I/O, so no seek state is shared
/// between queues.
pub struct FileBackend {
    file: File,
    size: u64,
}

impl FileBackend {
    /// Open `path` read-write and serve its current length. The length is
    /// captured once; growing or truncating the file underneath a live
    /// device is not supported.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl Backend for FileBackend {
    fn size(&self) -> u64 {
        self.size
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FLUSH | Capabilities::SYNC
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = clamp_range(offset, buf.len(), self.size);
        if n == 0 {
            return Ok(0);
        }

        let mut done = 0;
        while done < n {
            match self.file.read_at(&mut buf[done..n], offset + done as u64) {
                Ok(0) => break,
                Ok(r) => done += r,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        // A file shorter than its recorded size reads as zeroes past EOF.
        buf[done..n].fill(0);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if offset >= self.size {
            return Err(Error::OutOfRange {
                offset,
                size: self.size,
            });
        }

        let n = clamp_range(offset, buf.len(), self.size);
        self.file.write_all_at(&buf[..n], offset)?;
        Ok(n)
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
