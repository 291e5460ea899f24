// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The operation-dispatch semantics of the queue runner, exercised against
//! a RAM backend without a kernel in the loop.

use backends::{Backend, Capabilities, RamBackend, Result};
use ublk_core::queue::dispatch;

const OP_READ: u8 = 0;
const OP_WRITE: u8 = 1;
const OP_FLUSH: u8 = 2;
const OP_DISCARD: u8 = 3;
const OP_WRITE_SAME: u8 = 4;
const OP_WRITE_ZEROES: u8 = 5;

const BS: usize = 512;

fn caps_of(backend: &dyn Backend) -> Capabilities {
    backend.capabilities()
}

#[test]
fn hello_ublk_write_read_round_trip() {
    let backend = RamBackend::new(64 << 20);
    let caps = caps_of(&backend);

    let mut buf = vec![0_u8; BS];
    buf[..13].copy_from_slice(b"Hello, ublk!\n");
    assert_eq!(
        dispatch(&backend, caps, OP_WRITE, 0, BS, &mut buf),
        BS as i32
    );

    let mut read_back = vec![0xAA_u8; BS];
    assert_eq!(
        dispatch(&backend, caps, OP_READ, 0, BS, &mut read_back),
        BS as i32
    );
    assert_eq!(&read_back[..13], b"Hello, ublk!\n");
    assert_eq!(&read_back[13..], &buf[13..]);
}

#[test]
fn read_spanning_the_end_returns_the_short_count() {
    let backend = RamBackend::new(100);
    let caps = caps_of(&backend);

    let mut buf = vec![0_u8; 50];
    assert_eq!(dispatch(&backend, caps, OP_READ, 80, 50, &mut buf), 20);
}

#[test]
fn write_past_the_end_surfaces_as_eio() {
    let backend = RamBackend::new(100);
    let caps = caps_of(&backend);

    let mut buf = vec![0_u8; 4];
    assert_eq!(
        dispatch(&backend, caps, OP_WRITE, 101, 4, &mut buf),
        -libc::EIO
    );
}

#[test]
fn discard_then_read_shows_zeroes() {
    let mut contents = vec![0_u8; 100];
    contents[..13].copy_from_slice(b"Hello, World!");
    let backend = RamBackend::from_contents(contents);
    let caps = caps_of(&backend);

    let mut buf = vec![0_u8; 16];
    assert_eq!(dispatch(&backend, caps, OP_DISCARD, 0, 5, &mut buf), 0);

    assert_eq!(dispatch(&backend, caps, OP_READ, 0, 13, &mut buf), 13);
    assert_eq!(&buf[..5], &[0; 5]);
    assert_eq!(&buf[5..13], b", World!");
}

#[test]
fn flush_is_a_no_op_without_the_capability() {
    let backend = RamBackend::new(100);
    let mut buf = [0_u8; 1];
    assert_eq!(
        dispatch(&backend, backend.capabilities(), OP_FLUSH, 0, 0, &mut buf),
        0
    );
}

#[test]
fn discard_without_the_capability_succeeds_as_a_no_op() {
    let backend = PlainBackend(RamBackend::from_contents(vec![7; 100]));
    let caps = caps_of(&backend);

    let mut buf = vec![0_u8; 8];
    assert_eq!(dispatch(&backend, caps, OP_DISCARD, 0, 8, &mut buf), 0);

    // Nothing was zeroed; the op succeeded without touching the store.
    assert_eq!(dispatch(&backend, caps, OP_READ, 0, 8, &mut buf), 8);
    assert_eq!(&buf, &[7; 8]);
}

#[test]
fn write_zeroes_falls_back_to_the_write_path() {
    let backend = PlainBackend(RamBackend::from_contents(vec![7; 100]));
    let caps = caps_of(&backend);

    let mut buf = vec![0xFF_u8; 10];
    assert_eq!(dispatch(&backend, caps, OP_WRITE_ZEROES, 2, 10, &mut buf), 0);

    let mut read_back = vec![0_u8; 14];
    assert_eq!(dispatch(&backend, caps, OP_READ, 0, 14, &mut read_back), 14);
    assert_eq!(&read_back[..2], &[7; 2]);
    assert_eq!(&read_back[2..12], &[0; 10]);
    assert_eq!(&read_back[12..], &[7; 2]);
}

#[test]
fn unknown_ops_are_rejected() {
    let backend = RamBackend::new(100);
    let caps = caps_of(&backend);

    let mut buf = [0_u8; 1];
    assert_eq!(
        dispatch(&backend, caps, OP_WRITE_SAME, 0, 0, &mut buf),
        -libc::EOPNOTSUPP
    );
    assert_eq!(
        dispatch(&backend, caps, 0x17, 0, 0, &mut buf),
        -libc::EOPNOTSUPP
    );
}

#[test]
fn random_writes_read_back_intact() {
    let backend = RamBackend::new(1 << 20);
    let caps = caps_of(&backend);

    // A deterministic pseudo-random 70/30 read/write mix over 4 KiB
    // blocks; every read of a previously written block must match what
    // went in.
    let mut state = 0x1234_5678_u64;
    let mut rng = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        (state >> 33) as u32
    };

    let block = 4096;
    let blocks = (1 << 20) / block;
    let mut shadow: Vec<Option<u8>> = vec![None; blocks];

    for _ in 0..2000 {
        let idx = rng() as usize % blocks;
        let offset = (idx * block) as u64;

        if rng() % 10 < 3 {
            let fill = (rng() & 0xff) as u8;
            let mut buf = vec![fill; block];
            assert_eq!(
                dispatch(&backend, caps, OP_WRITE, offset, block, &mut buf),
                block as i32
            );
            shadow[idx] = Some(fill);
        } else {
            let mut buf = vec![0_u8; block];
            assert_eq!(
                dispatch(&backend, caps, OP_READ, offset, block, &mut buf),
                block as i32
            );
            let expect = shadow[idx].unwrap_or(0);
            assert!(buf.iter().all(|&b| b == expect));
        }
    }
}

/// A backend with no optional capabilities, for the fallback paths.
struct PlainBackend(RamBackend);

impl Backend for PlainBackend {
    fn size(&self) -> u64 {
        self.0.size()
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.0.read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.0.write_at(buf, offset)
    }
}
