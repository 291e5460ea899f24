// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Kernel ABI for the ublk driver: command opcodes, passthrough payload
//! layouts, feature flags, and the shared-memory offsets of the character
//! device. Everything here mirrors a fixed kernel layout; the structs are
//! `#[repr(C)]` and their sizes are pinned by compile-time asserts.

use std::mem;

use bitflags::bitflags;
use log::*;

/// The process-wide control node.
pub const CTRL_DEV_PATH: &str = "/dev/ublk-control";

/// Per-device character node prefix; the device id is appended.
pub const CDEV_PREFIX: &str = "/dev/ublkc";

/// Per-device block node prefix; the device id is appended.
pub const BDEV_PREFIX: &str = "/dev/ublkb";

/// Upper bound the driver places on a single queue's depth. Also fixes the
/// per-queue stride of the descriptor region, so every queue's slice starts
/// page-aligned regardless of the configured depth.
pub const MAX_QUEUE_DEPTH: u16 = 4096;

/// Upper bound the driver places on the number of hardware queues.
pub const MAX_NR_QUEUES: u16 = 32;

/// Byte capacity of the command area in an extended (128-byte) SQE.
pub const SQE_CMD_BYTES: usize = 80;

/// mmap offset of the descriptor region on the character device.
pub const CMD_BUF_OFFSET: u64 = 0;

/// mmap offset of the I/O-buffer region on the character device.
pub const IO_BUF_OFFSET: u64 = 0x8000_0000;

/// Completion result of a fetch that carries a request.
pub const IO_RES_OK: i32 = 0;

/// Completion result of a fetch aborted because the queue is going away.
pub const IO_RES_ABORT: i32 = -libc::ENODEV;

/// Device states reported in [`DevInfo::state`].
pub const DEV_STATE_DEAD: u16 = 0;
pub const DEV_STATE_LIVE: u16 = 1;
pub const DEV_STATE_QUIESCED: u16 = 2;

bitflags! {
    /// Feature flags negotiated at device creation. The kernel clears the
    /// bits it does not support and reports the final set back in the
    /// device-info block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureFlags: u64 {
        const ZERO_COPY = 1 << 0;
        const URING_CMD_COMP_IN_TASK = 1 << 1;
        const NEED_GET_DATA = 1 << 2;
        const USER_RECOVERY = 1 << 3;
        const USER_RECOVERY_REISSUE = 1 << 4;
        const UNPRIVILEGED_DEV = 1 << 5;
        const CMD_IOCTL_ENCODE = 1 << 6;
        const USER_COPY = 1 << 7;
    }
}

bitflags! {
    /// Attributes carried in the basic parameter block.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceAttrs: u32 {
        const READ_ONLY = 1 << 0;
        const ROTATIONAL = 1 << 1;
        const VOLATILE_CACHE = 1 << 2;
        const FUA = 1 << 3;
    }
}

/// ioctl-style command number: `(dir=RW, type='u', nr, size)`.
pub const fn ioctl_code(nr: u32, size: u32) -> u32 {
    (3 << 30) | (size << 16) | (('u' as u32) << 8) | nr
}

/// Control commands understood by the driver on `/dev/ublk-control`.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CtrlOp {
    GetQueueAffinity = 1,
    GetDevInfo = 2,
    AddDev = 4,
    DelDev = 5,
    StartDev = 6,
    StopDev = 7,
    SetParams = 8,
    GetParams = 9,
}

impl CtrlOp {
    /// The modern, ioctl-encoded operation number.
    pub const fn ioctl(self) -> u32 {
        ioctl_code(self as u32, mem::size_of::<CtrlCmdBody>() as u32)
    }

    /// The ioctl encoding advertising the 48-byte payload some kernel
    /// header generations expect.
    pub const fn ioctl_compat(self) -> u32 {
        ioctl_code(self as u32, 48)
    }

    /// The pre-ioctl-encoding operation number.
    pub const fn legacy(self) -> u32 {
        self as u32
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::GetQueueAffinity => "GET_QUEUE_AFFINITY",
            Self::GetDevInfo => "GET_DEV_INFO",
            Self::AddDev => "ADD_DEV",
            Self::DelDev => "DEL_DEV",
            Self::StartDev => "START_DEV",
            Self::StopDev => "STOP_DEV",
            Self::SetParams => "SET_PARAMS",
            Self::GetParams => "GET_PARAMS",
        }
    }
}

/// I/O commands submitted against a per-device character node.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoCmdOp {
    Fetch = 0x20,
    CommitAndFetch = 0x21,
}

impl IoCmdOp {
    pub const fn ioctl(self) -> u32 {
        ioctl_code(self as u32, mem::size_of::<IoCmdBody>() as u32)
    }

    pub const fn legacy(self) -> u32 {
        self as u32
    }
}

/// Block-layer operation codes found in the low byte of a descriptor's
/// `op_flags` word.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
    Flush,
    Discard,
    WriteSame,
    WriteZeroes,
}

impl BlockOp {
    pub fn from_raw(op: u8) -> Option<Self> {
        match op {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            2 => Some(Self::Flush),
            3 => Some(Self::Discard),
            4 => Some(Self::WriteSame),
            5 => Some(Self::WriteZeroes),
            _ => None,
        }
    }
}

/// The 32-byte control-command payload, addressed to the control device.
/// `addr`/`len` optionally point at an auxiliary buffer (device-info block
/// or parameter block); `data` carries inline command data.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CtrlCmdBody {
    pub dev_id: u32,
    pub queue_id: u16,
    pub len: u16,
    pub addr: u64,
    pub data: u64,
    pub dev_path_len: u16,
    pub pad: u16,
    pub reserved: u32,
}

impl CtrlCmdBody {
    /// Requests device-id auto-assignment on ADD_DEV.
    pub const NEW_DEV_ID: u32 = u32::MAX;

    /// Marks a command as not queue-specific.
    pub const QUEUE_NONE: u16 = u16::MAX;

    pub fn to_sqe_cmd(&self) -> [u8; SQE_CMD_BYTES] {
        sqe_cmd_bytes(self)
    }
}

/// The 64-byte device-info block: filled in by userspace for ADD_DEV,
/// filled in by the kernel for GET_DEV_INFO (and updated in place on
/// ADD_DEV with the assigned id and negotiated flags).
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DevInfo {
    pub nr_hw_queues: u16,
    pub queue_depth: u16,
    pub state: u16,
    pub pad0: u16,
    pub max_io_buf_bytes: u32,
    pub dev_id: u32,
    pub ublksrv_pid: i32,
    pub pad1: u32,
    pub flags: u64,
    pub ublksrv_flags: u64,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub reserved1: u64,
    pub reserved2: u64,
}

impl DevInfo {
    pub fn features(&self) -> FeatureFlags {
        FeatureFlags::from_bits_truncate(self.flags)
    }

    pub fn state_desc(&self) -> &'static str {
        match self.state {
            DEV_STATE_DEAD => "DEAD",
            DEV_STATE_LIVE => "LIVE",
            DEV_STATE_QUIESCED => "QUIESCED",
            _ => "UNKNOWN",
        }
    }
}

/// Some kernel variants carry an 80-byte device-info block. The submission
/// buffer is sized for the larger form; the advertised length defaults to
/// 64 and can be overridden through the environment when talking to such a
/// kernel.
pub const DEV_INFO_LEN_MAX: usize = 80;

pub fn dev_info_len() -> u16 {
    let default = mem::size_of::<DevInfo>() as u16;

    let Ok(hint) = std::env::var("UBLK_DEV_INFO_SIZE") else {
        return default;
    };

    match hint.parse::<u16>() {
        Ok(n) if (default..=DEV_INFO_LEN_MAX as u16).contains(&n) => n,
        _ => {
            warn!("ignoring invalid UBLK_DEV_INFO_SIZE={hint:?}");
            default
        }
    }
}

/// The 24-byte request descriptor the kernel writes into the mapped
/// descriptor region. Valid to read only while the owning tag is between
/// its fetch completion and its commit submission.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct IoDesc {
    pub op_flags: u32,
    pub nr_sectors: u32,
    pub start_sector: u64,
    pub addr: u64,
}

impl IoDesc {
    /// The block operation, from the low 8 bits of `op_flags`.
    pub fn op(&self) -> u8 {
        (self.op_flags & 0xff) as u8
    }

    pub fn flags(&self) -> u32 {
        self.op_flags >> 8
    }
}

/// The 16-byte I/O command sent inside fetch and commit-and-fetch
/// submissions. `result` is meaningful on commit; `addr` donates the tag's
/// buffer on fetch.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct IoCmdBody {
    pub q_id: u16,
    pub tag: u16,
    pub result: i32,
    pub addr: u64,
}

impl IoCmdBody {
    pub fn to_sqe_cmd(&self) -> [u8; SQE_CMD_BYTES] {
        sqe_cmd_bytes(self)
    }
}

/// The basic parameter sub-block: geometry and limits.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ParamBasic {
    pub attrs: u32,
    pub logical_bs_shift: u8,
    pub physical_bs_shift: u8,
    pub io_opt_shift: u8,
    pub io_min_shift: u8,
    pub max_sectors: u32,
    pub chunk_sectors: u32,
    pub dev_sectors: u64,
    pub virt_boundary_mask: u64,
}

/// The optional discard parameter sub-block.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ParamDiscard {
    pub discard_alignment: u32,
    pub discard_granularity: u32,
    pub max_discard_sectors: u32,
    pub max_write_zeroes_sectors: u32,
    pub max_discard_segments: u16,
    pub reserved0: u16,
}

/// The parameter block for SET_PARAMS/GET_PARAMS. `len` is
/// self-describing and must match the serialized size actually sent;
/// `types` is the bitmask of sub-blocks present.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct Params {
    pub len: u32,
    pub types: u32,
    pub basic: ParamBasic,
    pub discard: ParamDiscard,
}

impl Params {
    pub const TYPE_BASIC: u32 = 1 << 0;
    pub const TYPE_DISCARD: u32 = 1 << 1;

    /// An empty block with only `len` filled in, for GET_PARAMS.
    pub fn empty() -> Self {
        Self {
            len: mem::size_of::<Self>() as u32,
            ..Default::default()
        }
    }
}

/// mmap offset of queue `q`'s descriptor slice. The stride is the maximum
/// queue depth, not the configured one; the driver's layout is fixed.
pub const fn desc_region_offset(q: u16) -> u64 {
    CMD_BUF_OFFSET + q as u64 * MAX_QUEUE_DEPTH as u64 * mem::size_of::<IoDesc>() as u64
}

/// mmap offset of queue `q`'s I/O-buffer slice: `depth` buffers of
/// `buf_bytes` each per queue, above [`IO_BUF_OFFSET`].
pub const fn io_buf_region_offset(q: u16, depth: u16, buf_bytes: u32) -> u64 {
    IO_BUF_OFFSET + q as u64 * depth as u64 * buf_bytes as u64
}

fn sqe_cmd_bytes<T: Copy>(v: &T) -> [u8; SQE_CMD_BYTES] {
    let mut buf = [0_u8; SQE_CMD_BYTES];

    // SAFETY: the asserts below pin every payload type to at most the SQE
    // command area; `buf` is valid for writes of that size.
    unsafe {
        buf.as_mut_ptr().cast::<T>().write_unaligned(*v);
    }
    buf
}

const _: () = assert!(mem::size_of::<CtrlCmdBody>() == 32);
const _: () = assert!(mem::size_of::<DevInfo>() == 64);
const _: () = assert!(mem::size_of::<IoDesc>() == 24);
const _: () = assert!(mem::size_of::<IoCmdBody>() == 16);
const _: () = assert!(mem::size_of::<ParamBasic>() == 32);
const _: () = assert!(mem::size_of::<ParamDiscard>() == 20);
const _: () = assert!(mem::size_of::<Params>() == 64);
const _: () = assert!(mem::size_of::<CtrlCmdBody>() <= SQE_CMD_BYTES);
const _: () = assert!(mem::size_of::<IoCmdBody>() <= SQE_CMD_BYTES);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_encoding_matches_the_kernel_headers() {
        assert_eq!(CtrlOp::AddDev.ioctl(), 0xc020_7504);
        assert_eq!(CtrlOp::DelDev.ioctl(), 0xc020_7505);
        assert_eq!(CtrlOp::StartDev.ioctl(), 0xc020_7506);
        assert_eq!(CtrlOp::StopDev.ioctl(), 0xc020_7507);
        assert_eq!(CtrlOp::SetParams.ioctl(), 0xc020_7508);
        assert_eq!(CtrlOp::GetParams.ioctl(), 0xc020_7509);

        assert_eq!(IoCmdOp::Fetch.ioctl(), 0xc010_7520);
        assert_eq!(IoCmdOp::CommitAndFetch.ioctl(), 0xc010_7521);
    }

    #[test]
    fn legacy_encoding_is_the_bare_number() {
        assert_eq!(CtrlOp::AddDev.legacy(), 4);
        assert_eq!(IoCmdOp::Fetch.legacy(), 0x20);
        assert_eq!(CtrlOp::GetDevInfo.ioctl_compat(), 0xc030_7502);
    }

    #[test]
    fn descriptor_slices_start_page_aligned() {
        assert_eq!(desc_region_offset(0), 0);
        assert_eq!(desc_region_offset(1), 4096 * 24);
        assert_eq!(desc_region_offset(1) % 4096, 0);
    }

    #[test]
    fn buffer_slices_follow_the_configured_geometry() {
        assert_eq!(io_buf_region_offset(0, 32, 1 << 20), IO_BUF_OFFSET);
        assert_eq!(
            io_buf_region_offset(2, 32, 1 << 20),
            IO_BUF_OFFSET + 2 * 32 * (1 << 20)
        );
    }

    #[test]
    fn sqe_cmd_round_trips() {
        let cmd = IoCmdBody {
            q_id: 3,
            tag: 17,
            result: -5,
            addr: 0xdead_beef_0000,
        };

        let bytes = cmd.to_sqe_cmd();
        let back: IoCmdBody = unsafe { bytes.as_ptr().cast::<IoCmdBody>().read_unaligned() };

        assert_eq!(back.q_id, 3);
        assert_eq!(back.tag, 17);
        assert_eq!(back.result, -5);
        assert_eq!(back.addr, 0xdead_beef_0000);
        assert!(bytes[mem::size_of::<IoCmdBody>()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn descriptor_accessors_split_op_and_flags() {
        let iod = IoDesc {
            op_flags: (0x7 << 8) | 1,
            nr_sectors: 8,
            start_sector: 2048,
            addr: 0,
        };

        assert_eq!(iod.op(), 1);
        assert_eq!(iod.flags(), 0x7);
        assert_eq!(BlockOp::from_raw(iod.op()), Some(BlockOp::Write));
        assert_eq!(BlockOp::from_raw(9), None);
    }

    #[test]
    fn dev_info_len_honors_the_environment_hint() {
        assert_eq!(dev_info_len(), 64);

        std::env::set_var("UBLK_DEV_INFO_SIZE", "80");
        assert_eq!(dev_info_len(), 80);

        std::env::set_var("UBLK_DEV_INFO_SIZE", "12");
        assert_eq!(dev_info_len(), 64);

        std::env::remove_var("UBLK_DEV_INFO_SIZE");
    }
}
