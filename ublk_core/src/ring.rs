// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A thin abstraction over an io_uring instance used exclusively for
//! passthrough commands against one character device. The ring knows
//! nothing about ublk semantics; callers supply the command operation
//! numbers and payload bytes.

use std::os::fd::RawFd;
use std::time::Duration;

use io_uring::{cqueue, opcode, squeue, types, IoUring};

use crate::sys::SQE_CMD_BYTES;
use crate::{Error, RingError};

/// One extended-entry io_uring bound to a single target handle.
///
/// The ring is built with 128-byte SQEs and 32-byte CQEs; the passthrough
/// command body lives in the SQE tail area, driver completion metadata in
/// the CQE tail area. The target handle is registered at fixed index 0 so
/// submissions skip the per-call fd lookup.
///
/// The release store publishing the shared `sq_tail` and the acquire load
/// observing the shared `cq_tail` are performed inside the `io-uring`
/// crate's shared-ring code; this type is the only path to that memory.
pub struct Ring {
    ring: IoUring<squeue::Entry128, cqueue::Entry32>,
}

impl Ring {
    /// Build a ring of at least `entries` slots against `target`.
    ///
    /// Kernels that refuse extended SQEs or CQEs fail here with
    /// [`Error::UnsupportedKernel`].
    pub fn new(target: RawFd, entries: u32) -> Result<Self, Error> {
        let ring = IoUring::<squeue::Entry128, cqueue::Entry32>::builder()
            .build(entries)
            .map_err(|e| match e.raw_os_error() {
                Some(libc::EINVAL) | Some(libc::ENOSYS) => Error::UnsupportedKernel,
                _ => Error::Io(e),
            })?;

        ring.submitter()
            .register_files(&[target])
            .map_err(Error::Io)?;

        Ok(Self { ring })
    }

    /// Reserve a submission slot and fill it with a passthrough command.
    /// No system call is made until [`flush`](Self::flush).
    pub fn prepare_passthrough(
        &mut self,
        cmd_op: u32,
        cmd: [u8; SQE_CMD_BYTES],
        user_data: u64,
    ) -> Result<(), Error> {
        let sqe = opcode::UringCmd80::new(types::Fixed(0), cmd_op)
            .cmd(cmd)
            .build()
            .user_data(user_data);

        // SAFETY: the command payload is copied into the SQE itself, so no
        // caller memory needs to outlive the submission.
        unsafe { self.ring.submission().push(&sqe) }.map_err(|_| Error::Ring(RingError::Full))
    }

    /// Publish all prepared entries to the kernel in one system call.
    /// Returns the number of entries the kernel consumed.
    pub fn flush(&mut self) -> Result<usize, Error> {
        self.ring
            .submit()
            .map_err(|e| Error::Ring(RingError::Submit(e)))
    }

    /// Prepare and publish a single command.
    pub fn submit_one(
        &mut self,
        cmd_op: u32,
        cmd: [u8; SQE_CMD_BYTES],
        user_data: u64,
    ) -> Result<(), Error> {
        self.prepare_passthrough(cmd_op, cmd, user_data)?;
        self.flush()?;
        Ok(())
    }

    /// Block until at least `min_complete` completions are visible or the
    /// deadline passes. Also publishes any prepared entries.
    ///
    /// A `deadline` of `None` blocks indefinitely and is only safe when the
    /// caller is otherwise quiesced; the data-plane loop always passes a
    /// finite deadline so cancellation and stall detection stay live.
    pub fn wait(&self, min_complete: usize, deadline: Option<Duration>) -> Result<(), Error> {
        let res = match deadline {
            Some(d) => {
                let ts = types::Timespec::new()
                    .sec(d.as_secs())
                    .nsec(d.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(min_complete, &args)
            }
            None => self.ring.submitter().submit_and_wait(min_complete),
        };

        match res {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => Err(Error::Timeout),
            // A signal just means there is nothing to reap yet.
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => Ok(()),
            Err(e) => Err(Error::Ring(RingError::Submit(e))),
        }
    }

    /// Hand every visible completion to `sink` as a `(user_data, result)`
    /// pair. Never blocks.
    pub fn drain(&mut self, mut sink: impl FnMut(u64, i32)) -> usize {
        let mut reaped = 0;
        for cqe in self.ring.completion() {
            sink(cqe.user_data(), cqe.result());
            reaped += 1;
        }
        reaped
    }
}
