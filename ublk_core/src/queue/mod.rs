// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The per-queue data plane. One `QueueRunner` per queue, driven on a
//! dedicated thread: it primes a fetch per tag, then loops reaping
//! completions, executing requests against the backend, and batching
//! commit-and-fetch submissions back to the kernel.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backends::{Backend, Capabilities};
use log::*;

use crate::ring::Ring;
use crate::sys::{self, BlockOp, FeatureFlags, IoCmdOp};
use crate::Error;

pub mod shmem;
pub mod tags;

use shmem::{BufRegion, DescMap};
use tags::{TagState, TagTable};

/// Deadline for one data-plane wait. A stalled kernel (or a missing memory
/// barrier) shows up as periodic timeout warnings instead of a silent hang.
pub const WAIT_DEADLINE: Duration = Duration::from_secs(20);

/// Which half of the tag cycle an in-flight command belongs to, carried in
/// the command's user data next to the tag.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CmdKind {
    Fetch,
    Commit,
}

pub fn encode_user_data(tag: u16, kind: CmdKind) -> u64 {
    let kind = match kind {
        CmdKind::Fetch => 0_u64,
        CmdKind::Commit => 1_u64,
    };
    tag as u64 | (kind << 16)
}

pub fn decode_user_data(data: u64) -> (u16, CmdKind) {
    let kind = if (data >> 16) & 0xff == 0 {
        CmdKind::Fetch
    } else {
        CmdKind::Commit
    };
    ((data & 0xffff) as u16, kind)
}

/// Per-queue settings handed from the device layer to each queue thread.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub dev_id: u32,
    pub q_id: u16,
    pub depth: u16,
    pub buf_bytes: u32,
    pub block_size: u32,
    pub features: FeatureFlags,
}

/// Owns everything one queue needs: the character-device handle, the ring,
/// the two shared mappings, and the tag table. Fields are declared in
/// release order: mappings unmap before the ring goes away, and the ring
/// before the character device closes.
pub struct QueueRunner {
    descs: DescMap,
    bufs: BufRegion,
    ring: Ring,
    _cdev: File,
    spec: QueueSpec,
    tags: TagTable,
    backend: Arc<dyn Backend>,
    caps: Capabilities,
    cancel: Arc<AtomicBool>,
    completions: Vec<(u64, i32)>,
}

impl QueueRunner {
    /// Open the queue's character device and set up its data plane. Must
    /// be called on the thread that will run the queue: the driver ties
    /// every command on the ring to the submitting task.
    pub fn new(
        spec: QueueSpec,
        backend: Arc<dyn Backend>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let cdev = File::options()
            .read(true)
            .write(true)
            .open(format!("{}{}", sys::CDEV_PREFIX, spec.dev_id))?;

        let ring = Ring::new(cdev.as_raw_fd(), spec.depth as u32)?;
        let descs = DescMap::new(&cdev, spec.q_id, spec.depth)?;
        let bufs = BufRegion::new(&cdev, spec.q_id, spec.depth, spec.buf_bytes)?;

        let caps = backend.capabilities();
        let depth = spec.depth;

        trace!("queue {}: data plane ready", spec.q_id);

        Ok(Self {
            descs,
            bufs,
            ring,
            _cdev: cdev,
            spec,
            tags: TagTable::new(depth),
            backend,
            caps,
            cancel,
            completions: Vec::with_capacity(depth as usize),
        })
    }

    /// Arm every tag with its initial fetch, published in a single flush.
    /// Batching here is load-bearing: the driver holds START_DEV until it
    /// has seen a fetch per tag, and per-tag submission widens the window
    /// between the last fetch and the start signal.
    pub fn prime(&mut self) -> Result<(), Error> {
        let cmd_op = self.io_cmd_op(IoCmdOp::Fetch);

        for tag in 0..self.spec.depth {
            let cmd = sys::IoCmdBody {
                q_id: self.spec.q_id,
                tag,
                result: -1,
                addr: self.bufs.tag_addr(tag),
            };
            self.ring
                .prepare_passthrough(cmd_op, cmd.to_sqe_cmd(), encode_user_data(tag, CmdKind::Fetch))?;
        }

        let submitted = self.ring.flush()?;
        debug!("queue {}: primed {submitted} fetches", self.spec.q_id);
        Ok(())
    }

    /// Drive the queue until every tag retires (device stop) or
    /// cancellation is requested. Returns [`Error::Cancelled`] on the
    /// latter so callers can tell the two exits apart.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                self.drain_cancelled()?;
                return Err(Error::Cancelled);
            }

            match self.ring.wait(1, Some(WAIT_DEADLINE)) {
                Ok(()) => {}
                Err(Error::Timeout) => {
                    warn!(
                        "queue {}: no completion within {WAIT_DEADLINE:?} ({} tags live)",
                        self.spec.q_id,
                        self.tags.live()
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }

            self.process_batch()?;

            if self.tags.live() == 0 {
                debug!("queue {}: all tags retired", self.spec.q_id);
                return Ok(());
            }
        }
    }

    /// Reap one batch of completions and commit every request it carried
    /// with a single flush.
    fn process_batch(&mut self) -> Result<(), Error> {
        let mut batch = std::mem::take(&mut self.completions);
        batch.clear();
        self.ring.drain(|user_data, res| batch.push((user_data, res)));

        let mut commits = 0;
        let mut failure = None;

        for &(user_data, res) in &batch {
            let (tag, kind) = decode_user_data(user_data);
            trace!(
                "queue {}: cqe tag {tag} {kind:?} res {res}",
                self.spec.q_id
            );

            match self.tags.on_completion(tag, res) {
                Ok(TagState::Owned) => {
                    if let Err(e) = self.service(tag) {
                        failure = Some(e);
                        break;
                    }
                    commits += 1;
                }
                Ok(_) => trace!("queue {}: tag {tag} retired ({res})", self.spec.q_id),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.completions = batch;

        if let Some(e) = failure {
            return Err(e);
        }

        if commits > 0 {
            self.ring.flush()?;
        }
        Ok(())
    }

    /// Execute the request the kernel just handed to `tag` and prepare its
    /// commit-and-fetch.
    fn service(&mut self, tag: u16) -> Result<(), Error> {
        let iod = self.descs.get(tag);
        let block_size = self.spec.block_size as u64;
        let offset = iod.start_sector * block_size;
        let len = iod.nr_sectors as u64 * block_size;

        if len > self.bufs.buf_bytes() as u64 {
            // The parameter block bounds requests to the buffer size; a
            // bigger one cannot have come from a well-behaved driver.
            return Err(Error::ProtocolViolation {
                tag,
                state: TagState::Owned,
            });
        }
        let len = len as usize;

        // SAFETY: `tag` is owned, so the kernel leaves its buffer alone
        // until the commit below is published.
        let buf = unsafe { self.bufs.tag_buf(tag, len) };
        let result = dispatch(self.backend.as_ref(), self.caps, iod.op(), offset, len, buf);

        let cmd = sys::IoCmdBody {
            q_id: self.spec.q_id,
            tag,
            result,
            addr: self.bufs.tag_addr(tag),
        };

        self.tags.on_commit(tag)?;
        self.ring.prepare_passthrough(
            self.io_cmd_op(IoCmdOp::CommitAndFetch),
            cmd.to_sqe_cmd(),
            encode_user_data(tag, CmdKind::Commit),
        )
    }

    /// Cancellation path: stop servicing new work, reap whatever the
    /// kernel still completes, and leave. Outstanding fetches are aborted
    /// by the device stop that accompanies cancellation.
    fn drain_cancelled(&mut self) -> Result<(), Error> {
        debug!(
            "queue {}: cancelled, draining {} live tags",
            self.spec.q_id,
            self.tags.live()
        );

        while self.tags.live() > 0 {
            match self.ring.wait(1, Some(Duration::from_secs(1))) {
                Ok(()) => {}
                Err(Error::Timeout) => break,
                Err(e) => return Err(e),
            }

            let mut batch = std::mem::take(&mut self.completions);
            batch.clear();
            self.ring.drain(|user_data, res| batch.push((user_data, res)));

            for &(user_data, res) in &batch {
                let (tag, _) = decode_user_data(user_data);
                // Requests delivered during shutdown are dropped; the
                // kernel fails them when the queue goes away.
                self.tags.on_completion(tag, res)?;
            }
            self.completions = batch;
        }
        Ok(())
    }

    fn io_cmd_op(&self, op: IoCmdOp) -> u32 {
        if self.spec.features.contains(FeatureFlags::CMD_IOCTL_ENCODE) {
            op.ioctl()
        } else {
            op.legacy()
        }
    }
}

/// Execute one request against the backend and encode the commit result: a
/// non-negative count of bytes serviced, or a negated errno.
///
/// Backend faults are deliberately not retried; the kernel decides whether
/// to re-issue or surface `-EIO` to its caller.
pub fn dispatch(
    backend: &dyn Backend,
    caps: Capabilities,
    op: u8,
    offset: u64,
    len: usize,
    buf: &mut [u8],
) -> i32 {
    match BlockOp::from_raw(op) {
        Some(BlockOp::Read) => match backend.read_at(&mut buf[..len], offset) {
            Ok(n) => n as i32,
            Err(e) => {
                warn!("read of {len} bytes at {offset} failed: {e}");
                -libc::EIO
            }
        },
        Some(BlockOp::Write) => match backend.write_at(&buf[..len], offset) {
            Ok(n) => n as i32,
            Err(e) => {
                warn!("write of {len} bytes at {offset} failed: {e}");
                -libc::EIO
            }
        },
        Some(BlockOp::Flush) => {
            if !caps.contains(Capabilities::FLUSH) {
                return 0;
            }
            match backend.flush() {
                Ok(()) => 0,
                Err(e) => {
                    warn!("flush failed: {e}");
                    -libc::EIO
                }
            }
        }
        Some(BlockOp::Discard) => {
            if !caps.contains(Capabilities::DISCARD) {
                return 0;
            }
            match backend.discard(offset, len as u64) {
                Ok(()) => 0,
                Err(e) => {
                    warn!("discard of {len} bytes at {offset} failed: {e}");
                    -libc::EIO
                }
            }
        }
        Some(BlockOp::WriteZeroes) => write_zeroes(backend, caps, offset, len, buf),
        Some(BlockOp::WriteSame) | None => -libc::EOPNOTSUPP,
    }
}

/// Zero a range through the best path the backend offers: a native
/// write-zeroes, a discard, or an ordinary write of a zeroed buffer.
fn write_zeroes(
    backend: &dyn Backend,
    caps: Capabilities,
    offset: u64,
    len: usize,
    buf: &mut [u8],
) -> i32 {
    let res = if caps.contains(Capabilities::WRITE_ZEROES) {
        backend.write_zeroes(offset, len as u64)
    } else if caps.contains(Capabilities::DISCARD) {
        backend.discard(offset, len as u64)
    } else {
        buf[..len].fill(0);
        backend.write_at(&buf[..len], offset).map(|_| ())
    };

    match res {
        Ok(()) => 0,
        Err(e) => {
            warn!("write-zeroes of {len} bytes at {offset} failed: {e}");
            -libc::EIO
        }
    }
}
