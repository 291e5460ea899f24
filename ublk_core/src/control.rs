// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The control plane: lifecycle commands against `/dev/ublk-control` over
//! a dedicated (and lightly used) passthrough ring. Commands follow the
//! driver's sequencing contract of create, configure, prime, start, stop,
//! delete, and every non-zero completion surfaces as a typed error naming
//! the command.

use std::collections::HashMap;
use std::fs::File;
use std::mem;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use log::*;

use crate::device::DeviceConfig;
use crate::ring::Ring;
use crate::sys::{self, CtrlCmdBody, CtrlOp, DevInfo, FeatureFlags, Params};
use crate::{Error, RingError};

/// Ring slots for the control plane; at most one command is ever in
/// flight.
const CTRL_RING_ENTRIES: u32 = 16;

/// How long to poll for the block node after START_DEV.
const BDEV_POLL_TRIES: u32 = 50;
const BDEV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle position of a device this controller created. Skipping
/// configure, or starting an unconfigured device, is undefined behavior on
/// the kernel side; the controller refuses those orderings up front.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Configured,
    Started,
}

/// Owns the process's handle on the control device for its lifetime.
pub struct Controller {
    ring: Ring,
    _ctrl_dev: File,
    uniq: u64,
    devices: HashMap<u32, Lifecycle>,
}

impl Drop for Controller {
    fn drop(&mut self) {
        // Devices the owner never tore down would otherwise outlive the
        // process. Failures are expected here when teardown already ran.
        let leftover: Vec<u32> = self.devices.keys().copied().collect();
        for dev_id in leftover {
            let _ = self.stop(dev_id);
            if let Err(e) = self.delete(dev_id) {
                trace!("dev {dev_id}: delete on drop: {e}");
            }
        }
    }
}

impl Controller {
    pub fn new() -> Result<Self, Error> {
        let ctrl_dev = File::options()
            .read(true)
            .write(true)
            .open(sys::CTRL_DEV_PATH)?;

        let ring = Ring::new(ctrl_dev.as_raw_fd(), CTRL_RING_ENTRIES)?;

        Ok(Self {
            ring,
            _ctrl_dev: ctrl_dev,
            uniq: 0,
            devices: HashMap::new(),
        })
    }

    /// ADD_DEV: register a new device and parse the kernel-filled reply.
    ///
    /// The feature set always asks for completion in task context; the
    /// ioctl-encoded command set is probed for and dropped if this kernel
    /// predates it. Optional features are requested only on caller opt-in.
    /// The returned info carries the assigned device id and the negotiated
    /// flags.
    pub fn create(&mut self, cfg: &DeviceConfig) -> Result<DevInfo, Error> {
        let mut features = FeatureFlags::URING_CMD_COMP_IN_TASK | FeatureFlags::CMD_IOCTL_ENCODE;
        if cfg.unprivileged {
            features |= FeatureFlags::UNPRIVILEGED_DEV;
        }

        let info = match self.add_dev(cfg, features) {
            Err(Error::Control { errno, .. }) if errno == libc::EINVAL => {
                debug!("ADD_DEV rejected; retrying without CMD_IOCTL_ENCODE");
                self.add_dev(cfg, features - FeatureFlags::CMD_IOCTL_ENCODE)?
            }
            other => other?,
        };

        self.devices.insert(info.dev_id, Lifecycle::Created);
        Ok(info)
    }

    fn add_dev(&mut self, cfg: &DeviceConfig, features: FeatureFlags) -> Result<DevInfo, Error> {
        let info = DevInfo {
            nr_hw_queues: cfg.nr_queues,
            queue_depth: cfg.depth,
            max_io_buf_bytes: cfg.max_io_buf_bytes,
            dev_id: cfg.dev_id.unwrap_or(CtrlCmdBody::NEW_DEV_ID),
            // SAFETY: getpid/getuid/getgid cannot fail.
            ublksrv_pid: unsafe { libc::getpid() },
            flags: features.bits(),
            owner_uid: unsafe { libc::getuid() },
            owner_gid: unsafe { libc::getgid() },
            ..Default::default()
        };

        // The info block travels in an 80-byte buffer: some kernel
        // variants use the longer layout, and the advertised length can be
        // steered between the two (see sys::dev_info_len).
        let mut buf = [0_u8; sys::DEV_INFO_LEN_MAX];
        // SAFETY: DevInfo fits in the buffer by the sys layout asserts.
        unsafe { buf.as_mut_ptr().cast::<DevInfo>().write_unaligned(info) };

        let body = CtrlCmdBody {
            dev_id: info.dev_id,
            queue_id: CtrlCmdBody::QUEUE_NONE,
            len: sys::dev_info_len(),
            addr: buf.as_mut_ptr() as u64,
            ..Default::default()
        };
        self.command(CtrlOp::AddDev, body)?;

        // SAFETY: the kernel updated the block in place; either accepted
        // length starts with the 64-byte layout.
        let filled = unsafe { buf.as_ptr().cast::<DevInfo>().read_unaligned() };
        debug!(
            "dev {}: created, state {}, negotiated flags {:#x}",
            filled.dev_id,
            filled.state_desc(),
            filled.flags
        );
        Ok(filled)
    }

    /// SET_PARAMS: hand the device its parameter block. Valid only before
    /// START_DEV.
    pub fn configure(&mut self, dev_id: u32, params: &Params) -> Result<(), Error> {
        if self.devices.get(&dev_id) == Some(&Lifecycle::Started) {
            return Err(Error::Config("parameters can only be set before start"));
        }

        let mut p = *params;
        p.len = mem::size_of::<Params>() as u32;

        let body = CtrlCmdBody {
            dev_id,
            queue_id: CtrlCmdBody::QUEUE_NONE,
            len: p.len as u16,
            addr: std::ptr::addr_of_mut!(p) as u64,
            ..Default::default()
        };
        self.command(CtrlOp::SetParams, body)?;

        self.devices.insert(dev_id, Lifecycle::Configured);
        Ok(())
    }

    /// START_DEV: expose the block node. The driver holds this command
    /// until it has observed a fetch per tag per queue, so every queue
    /// must have primed before it is issued.
    pub fn start(&mut self, dev_id: u32) -> Result<(), Error> {
        if self.devices.get(&dev_id) != Some(&Lifecycle::Configured) {
            return Err(Error::Config("device must be configured before start"));
        }

        let body = CtrlCmdBody {
            dev_id,
            queue_id: CtrlCmdBody::QUEUE_NONE,
            // SAFETY: getpid cannot fail.
            data: unsafe { libc::getpid() } as u64,
            ..Default::default()
        };
        self.command(CtrlOp::StartDev, body)?;

        self.devices.insert(dev_id, Lifecycle::Started);
        Ok(())
    }

    /// Poll for the block node START_DEV creates, with a bounded retry.
    pub fn wait_for_bdev(&self, dev_id: u32) -> Result<PathBuf, Error> {
        let path = PathBuf::from(format!("{}{}", sys::BDEV_PREFIX, dev_id));

        for _ in 0..BDEV_POLL_TRIES {
            if path.exists() {
                return Ok(path);
            }
            std::thread::sleep(BDEV_POLL_INTERVAL);
        }

        error!("{} did not appear after START_DEV", path.display());
        Err(Error::Control {
            op: CtrlOp::StartDev.name(),
            errno: libc::ENOENT,
        })
    }

    /// STOP_DEV: freeze and remove the block node; every in-flight fetch
    /// completes with an abort result.
    pub fn stop(&mut self, dev_id: u32) -> Result<(), Error> {
        let body = CtrlCmdBody {
            dev_id,
            queue_id: CtrlCmdBody::QUEUE_NONE,
            ..Default::default()
        };
        self.command(CtrlOp::StopDev, body)?;

        if self.devices.get(&dev_id) == Some(&Lifecycle::Started) {
            self.devices.insert(dev_id, Lifecycle::Configured);
        }
        Ok(())
    }

    /// DEL_DEV: release the device id and the character node. Valid only
    /// once the device is dead.
    pub fn delete(&mut self, dev_id: u32) -> Result<(), Error> {
        let body = CtrlCmdBody {
            dev_id,
            queue_id: CtrlCmdBody::QUEUE_NONE,
            ..Default::default()
        };
        self.command(CtrlOp::DelDev, body)?;

        self.devices.remove(&dev_id);
        Ok(())
    }

    /// GET_DEV_INFO: the kernel's current view of the device.
    pub fn query(&mut self, dev_id: u32) -> Result<DevInfo, Error> {
        let mut buf = [0_u8; sys::DEV_INFO_LEN_MAX];

        let body = CtrlCmdBody {
            dev_id,
            queue_id: CtrlCmdBody::QUEUE_NONE,
            len: sys::dev_info_len(),
            addr: buf.as_mut_ptr() as u64,
            ..Default::default()
        };
        self.command(CtrlOp::GetDevInfo, body)?;

        // SAFETY: the kernel filled at least the 64-byte layout.
        Ok(unsafe { buf.as_ptr().cast::<DevInfo>().read_unaligned() })
    }

    /// GET_PARAMS: the device's current parameter block.
    pub fn query_params(&mut self, dev_id: u32) -> Result<Params, Error> {
        let mut params = Params::empty();

        let body = CtrlCmdBody {
            dev_id,
            queue_id: CtrlCmdBody::QUEUE_NONE,
            len: params.len as u16,
            addr: std::ptr::addr_of_mut!(params) as u64,
            ..Default::default()
        };
        self.command(CtrlOp::GetParams, body)?;
        Ok(params)
    }

    /// GET_QUEUE_AFFINITY: the CPU set the driver associates with one
    /// queue, used to pin the queue's thread.
    pub fn queue_affinity(&mut self, dev_id: u32, q_id: u16) -> Result<libc::cpu_set_t, Error> {
        // SAFETY: an all-zero byte pattern is a valid cpu_set_t.
        let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };

        let body = CtrlCmdBody {
            dev_id,
            queue_id: CtrlCmdBody::QUEUE_NONE,
            len: mem::size_of::<libc::cpu_set_t>() as u16,
            addr: std::ptr::addr_of_mut!(set) as u64,
            data: q_id as u64,
            ..Default::default()
        };
        self.command(CtrlOp::GetQueueAffinity, body)?;
        Ok(set)
    }

    /// Issue one control command, trying the ioctl encoding first and
    /// falling back for older kernels.
    ///
    /// The payload is encoded at 32 bytes; a kernel that answers
    /// `-EINVAL` is retried once advertising the 48-byte length some
    /// header generations expect, and finally with the legacy un-encoded
    /// opcode.
    fn command(&mut self, op: CtrlOp, body: CtrlCmdBody) -> Result<(), Error> {
        match self.submit(op, op.ioctl(), &body) {
            Err(Error::Control { errno, .. }) if errno == libc::EINVAL => {
                debug!("{}: 32-byte ioctl encoding rejected", op.name());
            }
            other => return other,
        }

        match self.submit(op, op.ioctl_compat(), &body) {
            Err(Error::Control { errno, .. }) if errno == libc::EINVAL => {
                debug!("{}: 48-byte ioctl encoding rejected, using legacy", op.name());
            }
            other => return other,
        }

        self.submit(op, op.legacy(), &body)
    }

    fn submit(&mut self, op: CtrlOp, cmd_op: u32, body: &CtrlCmdBody) -> Result<(), Error> {
        self.uniq += 1;
        let uniq = self.uniq;

        trace!("control: {} (cmd_op {cmd_op:#x}, uniq {uniq})", op.name());

        // Control commands wait without a deadline: the auxiliary buffer a
        // command points at lives on the caller's stack, so returning
        // before the completion would hand the kernel freed memory. The
        // control plane is quiesced while a command is out, which is the
        // one situation an unbounded wait is allowed in.
        self.ring.submit_one(cmd_op, body.to_sqe_cmd(), uniq)?;
        self.ring.wait(1, None)?;

        let mut result = None;
        self.ring.drain(|user_data, res| {
            if user_data == uniq {
                result = Some(res);
            } else {
                warn!("control: dropping stale completion {user_data:#x}");
            }
        });

        match result {
            Some(res) if res >= 0 => Ok(()),
            Some(res) => Err(Error::Control {
                op: op.name(),
                errno: -res,
            }),
            None => Err(Error::Ring(RingError::Stale(uniq))),
        }
    }
}
