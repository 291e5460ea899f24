// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::*;
use nix::sys::signal::{SigSet, Signal};

use backends::{parse_size, Backend, FileBackend, RamBackend};
use ublk_core::{create_and_serve, DeviceConfig};

/// Serve a RAM- or file-backed ublk block device until interrupted.
#[derive(Parser)]
struct Cli {
    /// Device size for the RAM backend, e.g. 64M or 2G.
    #[arg(long, value_parser = parse_size, required_unless_present = "file", conflicts_with = "file")]
    size: Option<u64>,

    /// Serve an existing file instead of RAM.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Number of queues (one pinned thread each).
    #[arg(long, default_value_t = 1)]
    queues: u16,

    /// Outstanding requests per queue.
    #[arg(long, default_value_t = 64)]
    depth: u16,

    /// Largest single I/O, e.g. 512K.
    #[arg(long, value_parser = parse_size, default_value = "512K")]
    io_buf_size: u64,

    /// Logical block size in bytes.
    #[arg(long, default_value_t = 512)]
    block_size: u32,

    /// Request an unprivileged device.
    #[arg(long)]
    unprivileged: bool,

    /// Log more; repeat for trace output.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Cli::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    // Block the shutdown signals before any other thread exists so the
    // dedicated waiter below is the only place they are delivered.
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    if let Err(e) = signals.thread_block() {
        eprintln!("ublkd: blocking signals: {e}");
        return ExitCode::FAILURE;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        std::thread::spawn(move || match signals.wait() {
            Ok(sig) => {
                info!("received {sig}, shutting down");
                shutdown.store(true, Ordering::Relaxed);
            }
            Err(e) => {
                error!("sigwait failed: {e}");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    let backend: Arc<dyn Backend> = match (&args.file, args.size) {
        (Some(path), _) => match FileBackend::open(path) {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                eprintln!("ublkd: opening {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        (None, Some(size)) => Arc::new(RamBackend::new(size)),
        // clap enforces exactly one of --size and --file.
        (None, None) => unreachable!(),
    };

    if args.io_buf_size > u32::MAX as u64 {
        eprintln!("ublkd: --io-buf-size does not fit in 32 bits");
        return ExitCode::FAILURE;
    }

    let cfg = DeviceConfig {
        dev_id: None,
        nr_queues: args.queues,
        depth: args.depth,
        max_io_buf_bytes: args.io_buf_size as u32,
        logical_block_size: args.block_size,
        unprivileged: args.unprivileged,
    };

    match create_and_serve(&cfg, backend, shutdown, |info, bdev| {
        println!("{}", bdev.display());
        println!("{}{}", ublk_core::sys::CDEV_PREFIX, info.dev_id);
    }) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ublkd: {e}");
            ExitCode::FAILURE
        }
    }
}
