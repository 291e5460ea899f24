// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The two regions a queue shares with the kernel through its character
//! device: the read-only descriptor array and the read-write I/O-buffer
//! region. Both are plain `mmap`s; the descriptor read path carries the
//! acquire edge that pairs with the kernel's descriptor publish.

use std::fs::File;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use log::*;

use crate::sys::{self, IoDesc};
use crate::Error;

/// A shared mapping of part of the character device. Unmapped on drop;
/// the kernel keeps the device pinned until its mappings are gone.
struct Mmap {
    addr: *mut libc::c_void,
    len: usize,
}

// The mapping is created and destroyed with the queue it belongs to; the
// pointer never leaves that queue's thread except via the accessors below.
unsafe impl Send for Mmap {}

impl Mmap {
    fn new(cdev: &File, offset: u64, len: usize, prot: libc::c_int) -> Result<Self, Error> {
        // SAFETY: a fresh kernel-chosen mapping; failure is MAP_FAILED,
        // checked below.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                cdev.as_raw_fd(),
                offset as libc::off_t,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        Ok(Self { addr, len })
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        // SAFETY: addr/len came from a successful mmap.
        if unsafe { libc::munmap(self.addr, self.len) } != 0 {
            warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

/// Read-only view over the queue's slice of the kernel-written descriptor
/// array.
pub struct DescMap {
    map: Mmap,
    depth: u16,
}

impl DescMap {
    pub fn new(cdev: &File, q_id: u16, depth: u16) -> Result<Self, Error> {
        let len = round_up(depth as usize * mem::size_of::<IoDesc>(), page_size());
        let map = Mmap::new(cdev, sys::desc_region_offset(q_id), len, libc::PROT_READ)?;

        Ok(Self { map, depth })
    }

    /// Read the descriptor for `tag`.
    ///
    /// Only valid between the observation of `tag`'s fetch completion and
    /// the submission of its commit; the tag state machine enforces that
    /// window.
    pub fn get(&self, tag: u16) -> IoDesc {
        assert!(tag < self.depth, "descriptor index {tag} out of range");

        // SAFETY: construction mapped `depth` descriptors and the assert
        // above keeps `tag` inside them.
        unsafe { read_desc(self.map.addr.cast::<IoDesc>(), tag) }
    }
}

/// Read one descriptor from a kernel-shared array.
///
/// The acquire load on `op_flags` pairs with the kernel's publish of the
/// descriptor; the matching fetch CQE has already been observed through the
/// ring's acquire on `cq_tail`, so this is the second edge needed on weakly
/// ordered architectures. The remaining fields are stable once `op_flags`
/// is observed.
///
/// # Safety
///
/// `base` must point to at least `tag + 1` descriptors valid for reads.
unsafe fn read_desc(base: *const IoDesc, tag: u16) -> IoDesc {
    let p = base.add(tag as usize);
    let op_flags = (*p.cast::<AtomicU32>()).load(Ordering::Acquire);

    IoDesc {
        op_flags,
        nr_sectors: ptr::addr_of!((*p).nr_sectors).read_volatile(),
        start_sector: ptr::addr_of!((*p).start_sector).read_volatile(),
        addr: ptr::addr_of!((*p).addr).read_volatile(),
    }
}

/// The queue's slice of the I/O-buffer region: one fixed `buf_bytes` buffer
/// per tag, indexed exactly like the descriptor array.
pub struct BufRegion {
    map: Mmap,
    depth: u16,
    buf_bytes: u32,
}

impl BufRegion {
    pub fn new(cdev: &File, q_id: u16, depth: u16, buf_bytes: u32) -> Result<Self, Error> {
        let len = round_up(depth as usize * buf_bytes as usize, page_size());
        let map = Mmap::new(
            cdev,
            sys::io_buf_region_offset(q_id, depth, buf_bytes),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
        )?;

        Ok(Self {
            map,
            depth,
            buf_bytes,
        })
    }

    pub fn buf_bytes(&self) -> u32 {
        self.buf_bytes
    }

    /// Userspace address of `tag`'s buffer, advertised to the kernel in
    /// fetch commands.
    pub fn tag_addr(&self, tag: u16) -> u64 {
        assert!(tag < self.depth, "buffer index {tag} out of range");
        self.map.addr as u64 + tag as u64 * self.buf_bytes as u64
    }

    /// Exclusive view of the first `len` bytes of `tag`'s buffer.
    ///
    /// # Safety
    ///
    /// The caller must hold `tag` in the owned state: that is what
    /// guarantees the kernel is not writing this region concurrently.
    pub unsafe fn tag_buf(&self, tag: u16, len: usize) -> &mut [u8] {
        assert!(len <= self.buf_bytes as usize);
        std::slice::from_raw_parts_mut(self.tag_addr(tag) as *mut u8, len)
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(val: usize, to: usize) -> usize {
    (val + to - 1) & !(to - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_desc_decodes_from_a_shared_array() {
        let descs = [
            IoDesc::default(),
            IoDesc {
                op_flags: (0x3 << 8) | 1,
                nr_sectors: 8,
                start_sector: 2048,
                addr: 0x1000,
            },
        ];

        let got = unsafe { read_desc(descs.as_ptr(), 1) };
        assert_eq!(got, descs[1]);
        assert_eq!(got.op(), 1);

        let zero = unsafe { read_desc(descs.as_ptr(), 0) };
        assert_eq!(zero, IoDesc::default());
    }

    #[test]
    fn round_up_is_page_granular() {
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }
}
