// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Device orchestration: configuration defaults and validation, parameter
//! block assembly, and `create_and_serve`, which runs the whole lifecycle
//! (create, configure, prime, start, serve, stop, delete) around a
//! backend.

use std::io;
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use backends::{Backend, Capabilities};
use log::*;

use crate::control::Controller;
use crate::queue::{QueueRunner, QueueSpec};
use crate::sys::{self, DevInfo};
use crate::Error;

const SUPERVISE_INTERVAL: Duration = Duration::from_millis(250);

/// What to ask the kernel for when creating a device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// A specific device id, or kernel-assigned when `None`.
    pub dev_id: Option<u32>,

    /// Independent submission lanes, one pinned thread each.
    pub nr_queues: u16,

    /// Outstanding request slots per queue.
    pub depth: u16,

    /// Largest single I/O the device will accept, in bytes. Also the size
    /// of each tag's buffer.
    pub max_io_buf_bytes: u32,

    /// Logical block size in bytes.
    pub logical_block_size: u32,

    /// Request an unprivileged device at create.
    pub unprivileged: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            dev_id: None,
            nr_queues: 1,
            depth: 64,
            max_io_buf_bytes: 512 << 10,
            logical_block_size: 512,
            unprivileged: false,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.nr_queues == 0 || self.nr_queues > sys::MAX_NR_QUEUES {
            return Err(Error::Config("queue count must be between 1 and 32"));
        }
        if self.depth == 0 || self.depth > sys::MAX_QUEUE_DEPTH {
            return Err(Error::Config("queue depth must be between 1 and 4096"));
        }
        if !self.logical_block_size.is_power_of_two() || self.logical_block_size < 512 {
            return Err(Error::Config("block size must be a power of two, at least 512"));
        }
        if self.max_io_buf_bytes == 0 || self.max_io_buf_bytes % self.logical_block_size != 0 {
            return Err(Error::Config(
                "max I/O size must be a nonzero multiple of the block size",
            ));
        }
        Ok(())
    }
}

/// Build the parameter block SET_PARAMS sends: geometry from the backend
/// size and the config, plus a discard block when the backend can zero
/// ranges.
pub fn device_params(cfg: &DeviceConfig, backend: &dyn Backend) -> sys::Params {
    let bs = cfg.logical_block_size;
    let bs_shift = bs.trailing_zeros() as u8;
    let caps = backend.capabilities();

    let mut attrs = sys::DeviceAttrs::empty();
    if caps.contains(Capabilities::FLUSH) {
        attrs |= sys::DeviceAttrs::VOLATILE_CACHE;
    }

    let mut params = sys::Params {
        len: mem::size_of::<sys::Params>() as u32,
        types: sys::Params::TYPE_BASIC,
        basic: sys::ParamBasic {
            attrs: attrs.bits(),
            logical_bs_shift: bs_shift,
            physical_bs_shift: bs_shift,
            io_opt_shift: bs_shift,
            io_min_shift: bs_shift,
            max_sectors: cfg.max_io_buf_bytes >> bs_shift,
            chunk_sectors: 0,
            dev_sectors: backend.size() >> bs_shift,
            virt_boundary_mask: 0,
        },
        discard: sys::ParamDiscard::default(),
    };

    if caps.intersects(Capabilities::DISCARD | Capabilities::WRITE_ZEROES) {
        params.types |= sys::Params::TYPE_DISCARD;
        params.discard = sys::ParamDiscard {
            discard_alignment: 0,
            discard_granularity: bs,
            max_discard_sectors: if caps.contains(Capabilities::DISCARD) {
                u32::MAX >> bs_shift
            } else {
                0
            },
            max_write_zeroes_sectors: if caps.contains(Capabilities::WRITE_ZEROES) {
                u32::MAX >> bs_shift
            } else {
                0
            },
            max_discard_segments: 1,
            reserved0: 0,
        };
    }

    params
}

/// Create a device for `backend`, serve it until `shutdown` is set or a
/// queue fails, then tear it down. `on_ready` runs once the block node
/// exists.
///
/// On any non-recoverable failure the device is stopped and deleted before
/// the first error is returned, so a partial lifecycle never leaks a
/// device id.
pub fn create_and_serve(
    cfg: &DeviceConfig,
    backend: Arc<dyn Backend>,
    shutdown: Arc<AtomicBool>,
    on_ready: impl FnOnce(&DevInfo, &Path),
) -> Result<(), Error> {
    cfg.validate()?;

    let size = backend.size();
    if size == 0 || size % cfg.logical_block_size as u64 != 0 {
        return Err(Error::Config(
            "backend size must be a nonzero multiple of the block size",
        ));
    }

    let mut ctrl = Controller::new()?;
    let info = ctrl.create(cfg)?;
    let dev_id = info.dev_id;
    info!(
        "dev {dev_id}: created ({} queues, depth {}, {} byte buffers, {size} bytes)",
        info.nr_hw_queues, info.queue_depth, info.max_io_buf_bytes
    );

    let res = serve(&mut ctrl, &info, cfg, backend, shutdown, on_ready);

    // The device may already be stopped (or never started); these are
    // best-effort.
    if let Err(e) = ctrl.stop(dev_id) {
        debug!("dev {dev_id}: STOP_DEV during teardown: {e}");
    }
    if let Err(e) = ctrl.delete(dev_id) {
        warn!("dev {dev_id}: DEL_DEV failed: {e}");
    } else {
        info!("dev {dev_id}: deleted");
    }

    res
}

fn serve(
    ctrl: &mut Controller,
    info: &DevInfo,
    cfg: &DeviceConfig,
    backend: Arc<dyn Backend>,
    shutdown: Arc<AtomicBool>,
    on_ready: impl FnOnce(&DevInfo, &Path),
) -> Result<(), Error> {
    let dev_id = info.dev_id;

    ctrl.configure(dev_id, &device_params(cfg, backend.as_ref()))?;
    raise_memlock_limit(cfg);

    let cancel = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();
    let mut starters = Vec::new();
    let mut handles = Vec::new();
    let mut spawn_err = None;

    for q_id in 0..cfg.nr_queues {
        let spec = QueueSpec {
            dev_id,
            q_id,
            depth: cfg.depth,
            buf_bytes: cfg.max_io_buf_bytes,
            block_size: cfg.logical_block_size,
            features: info.features(),
        };

        let affinity = match ctrl.queue_affinity(dev_id, q_id) {
            Ok(set) => Some(set),
            Err(e) => {
                debug!("queue {q_id}: no affinity from driver: {e}");
                None
            }
        };

        let (start_tx, start_rx) = mpsc::channel();
        match spawn_queue(
            spec,
            backend.clone(),
            cancel.clone(),
            affinity,
            ready_tx.clone(),
            start_rx,
        ) {
            Ok(handle) => {
                handles.push(handle);
                starters.push(start_tx);
            }
            Err(e) => {
                spawn_err = Some(Error::Io(e));
                break;
            }
        }
    }
    drop(ready_tx);

    let mut failed = spawn_err.is_some();
    for _ in 0..handles.len() {
        match ready_rx.recv() {
            Ok((q_id, true)) => trace!("queue {q_id}: primed and ready"),
            Ok((q_id, false)) => {
                error!("queue {q_id}: failed to come up");
                failed = true;
            }
            Err(_) => {
                failed = true;
                break;
            }
        }
    }

    if failed {
        cancel.store(true, Ordering::Relaxed);
        release_queues(&starters, false);
        let queue_err = join_queues(handles);
        return Err(spawn_err.or(queue_err).unwrap_or(Error::Cancelled));
    }

    if let Err(e) = ctrl.start(dev_id) {
        release_queues(&starters, false);
        join_queues(handles);
        return Err(e);
    }
    release_queues(&starters, true);

    let bdev = match ctrl.wait_for_bdev(dev_id) {
        Ok(path) => path,
        Err(e) => {
            let _ = ctrl.stop(dev_id);
            cancel.store(true, Ordering::Relaxed);
            join_queues(handles);
            return Err(e);
        }
    };

    info!("dev {dev_id}: live at {}", bdev.display());
    on_ready(info, &bdev);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("dev {dev_id}: shutdown requested");
            break;
        }
        if handles.iter().any(|h| h.is_finished()) {
            warn!("dev {dev_id}: a queue exited, stopping the device");
            break;
        }
        thread::sleep(SUPERVISE_INTERVAL);
    }

    // Stopping aborts every in-flight fetch, which is what lets the queue
    // loops drain and exit.
    if let Err(e) = ctrl.stop(dev_id) {
        debug!("dev {dev_id}: STOP_DEV: {e}");
        cancel.store(true, Ordering::Relaxed);
    }

    match join_queues(handles) {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

fn spawn_queue(
    spec: QueueSpec,
    backend: Arc<dyn Backend>,
    cancel: Arc<AtomicBool>,
    affinity: Option<libc::cpu_set_t>,
    ready_tx: mpsc::Sender<(u16, bool)>,
    start_rx: mpsc::Receiver<bool>,
) -> io::Result<JoinHandle<Result<(), Error>>> {
    thread::Builder::new()
        .name(format!("ublk-q{}", spec.q_id))
        .spawn(move || {
            let q_id = spec.q_id;
            if let Some(set) = affinity {
                pin_thread(&set, q_id);
            }

            // Everything from here on, priming included, happens on this
            // thread: the driver ties a queue's commands to the task that
            // issued its fetches.
            let mut runner = match QueueRunner::new(spec, backend, cancel) {
                Ok(runner) => runner,
                Err(e) => {
                    let _ = ready_tx.send((q_id, false));
                    return Err(e);
                }
            };
            if let Err(e) = runner.prime() {
                let _ = ready_tx.send((q_id, false));
                return Err(e);
            }

            let _ = ready_tx.send((q_id, true));
            match start_rx.recv() {
                Ok(true) => runner.run(),
                // Released without a start: unwind without serving.
                _ => Ok(()),
            }
        })
}

fn release_queues(starters: &[mpsc::Sender<bool>], go: bool) {
    for starter in starters {
        let _ = starter.send(go);
    }
}

/// Join every queue thread and keep the first real failure; clean exits
/// and cancellations are not failures.
fn join_queues(handles: Vec<JoinHandle<Result<(), Error>>>) -> Option<Error> {
    let mut first = None;

    for handle in handles {
        match handle.join() {
            Ok(Ok(())) | Ok(Err(Error::Cancelled)) => {}
            Ok(Err(e)) => {
                error!("queue failed: {e}");
                if first.is_none() {
                    first = Some(e);
                }
            }
            Err(_) => {
                error!("queue thread panicked");
                if first.is_none() {
                    first = Some(Error::Io(io::Error::new(
                        io::ErrorKind::Other,
                        "queue thread panicked",
                    )));
                }
            }
        }
    }

    first
}

fn pin_thread(set: &libc::cpu_set_t, q_id: u16) {
    // SAFETY: `set` is a valid cpu_set_t; pid 0 is the calling thread.
    let rc = unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), set) };
    if rc != 0 {
        warn!(
            "queue {q_id}: sched_setaffinity failed: {}",
            io::Error::last_os_error()
        );
    }
}

/// The descriptor and buffer mappings count against RLIMIT_MEMLOCK. Raise
/// the soft limit to cover them where possible; failure here is not fatal
/// because the mmap itself reports the real error.
fn raise_memlock_limit(cfg: &DeviceConfig) {
    let per_queue = cfg.depth as u64 * cfg.max_io_buf_bytes as u64
        + sys::MAX_QUEUE_DEPTH as u64 * mem::size_of::<sys::IoDesc>() as u64;
    let needed = cfg.nr_queues as u64 * per_queue;

    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `lim` is valid for writes.
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut lim) } != 0 {
        return;
    }
    if lim.rlim_cur == libc::RLIM_INFINITY || lim.rlim_cur >= needed {
        return;
    }

    let raised = libc::rlimit {
        rlim_cur: needed,
        rlim_max: if lim.rlim_max == libc::RLIM_INFINITY || lim.rlim_max >= needed {
            lim.rlim_max
        } else {
            needed
        },
    };
    // SAFETY: `raised` is a valid rlimit.
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &raised) } != 0 {
        warn!(
            "could not raise RLIMIT_MEMLOCK to {needed} bytes: {}",
            io::Error::last_os_error()
        );
    }
}
