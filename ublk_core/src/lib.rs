// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Userspace block devices over the Linux ublk driver.
//!
//! The [`control`] module sequences device lifecycle against
//! `/dev/ublk-control`; the [`queue`] module drives one queue's data plane
//! from a dedicated thread, coupling kernel-initiated fetches with
//! userspace commits over an [`ring::Ring`]. [`device::create_and_serve`]
//! ties the two together around a [`backends::Backend`].

use std::fmt;
use std::io;

pub mod control;
pub mod device;
pub mod queue;
pub mod ring;
pub mod sys;

pub use device::{create_and_serve, DeviceConfig};
pub use queue::tags::TagState;

/// The possible failures of the control plane and the data plane.
///
/// Backend faults are not represented here: they are surfaced to the kernel
/// as `-EIO` on the request that hit them and never terminate a queue.
#[derive(Debug)]
pub enum Error {
    /// The kernel lacks passthrough commands, extended SQEs, or extended
    /// CQEs.
    UnsupportedKernel,

    /// A device configuration was rejected before touching the kernel.
    Config(&'static str),

    /// A control command completed with a non-zero result.
    Control { op: &'static str, errno: i32 },

    /// The command ring failed underneath us.
    Ring(RingError),

    /// The per-tag state machine observed an impossible transition. This
    /// always means a bug on one side of the protocol and aborts the queue.
    ProtocolViolation { tag: u16, state: TagState },

    /// A bounded wait elapsed without completions. Recovered by the queue
    /// loop; surfaced only so callers of `Ring::wait` can tell it apart
    /// from failure.
    Timeout,

    /// The queue was asked to shut down. A normal exit path, not a fault.
    Cancelled,

    /// Errors returned by I/O failures.
    Io(io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnsupportedKernel => {
                write!(
                    f,
                    "kernel does not support io_uring passthrough with extended SQE/CQE"
                )
            }
            Self::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Control { op, errno } => {
                write!(
                    f,
                    "control command {op} failed: {}",
                    io::Error::from_raw_os_error(*errno)
                )
            }
            Self::Ring(e) => write!(f, "ring error: {e}"),
            Self::ProtocolViolation { tag, state } => {
                write!(f, "protocol violation: completion for tag {tag} in state {state:?}")
            }
            Self::Timeout => write!(f, "timed out waiting for completions"),
            Self::Cancelled => write!(f, "queue cancelled"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failures of the command ring itself.
#[derive(Debug)]
pub enum RingError {
    /// No free submission slot. The queue protocol bounds outstanding
    /// commands by the ring size, so hitting this is a caller bug.
    Full,

    /// The submission system call failed.
    Submit(io::Error),

    /// A completion batch did not contain the expected user data.
    Stale(u64),
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Full => write!(f, "submission queue full"),
            Self::Submit(e) => write!(f, "submit failed: {e}"),
            Self::Stale(user_data) => {
                write!(f, "no completion carried user data {user_data:#x}")
            }
        }
    }
}
