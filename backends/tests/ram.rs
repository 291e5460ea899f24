// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use backends::{Backend, Capabilities, Error, RamBackend};

#[test]
fn write_then_read_round_trip() {
    let backend = RamBackend::new(64 << 20);

    let payload = b"Hello, ublk!";
    assert_eq!(backend.write_at(payload, 0).unwrap(), payload.len());

    let mut buf = vec![0; payload.len()];
    assert_eq!(backend.read_at(&mut buf, 0).unwrap(), payload.len());
    assert_eq!(&buf, payload);
}

#[test]
fn read_spanning_the_end_truncates() {
    let backend = RamBackend::new(100);

    let mut buf = [0xAA_u8; 50];
    assert_eq!(backend.read_at(&mut buf, 80).unwrap(), 20);
}

#[test]
fn read_at_or_past_the_end_returns_zero_bytes() {
    let backend = RamBackend::new(100);

    let mut buf = [0_u8; 4];
    assert_eq!(backend.read_at(&mut buf, 100).unwrap(), 0);
    assert_eq!(backend.read_at(&mut buf, 101).unwrap(), 0);
}

#[test]
fn write_past_the_end_fails() {
    let backend = RamBackend::new(100);

    match backend.write_at(b"oops", 101) {
        Err(Error::OutOfRange { offset: 101, size: 100 }) => {}
        other => panic!("expected OutOfRange, got {other:?}"),
    }
    assert!(backend.write_at(b"oops", 100).is_err());
}

#[test]
fn write_spanning_the_end_truncates() {
    let backend = RamBackend::new(100);

    assert_eq!(backend.write_at(&[0xFF; 8], 96).unwrap(), 4);

    let mut buf = [0_u8; 4];
    assert_eq!(backend.read_at(&mut buf, 96).unwrap(), 4);
    assert_eq!(buf, [0xFF; 4]);
}

#[test]
fn discard_zeroes_the_range() {
    let mut contents = vec![0_u8; 100];
    contents[..13].copy_from_slice(b"Hello, World!");
    let backend = RamBackend::from_contents(contents);

    backend.discard(0, 5).unwrap();

    let mut buf = [0_u8; 13];
    assert_eq!(backend.read_at(&mut buf, 0).unwrap(), 13);
    assert_eq!(&buf[..5], &[0; 5]);
    assert_eq!(&buf[5..], b", World!");
}

#[test]
fn discard_past_the_end_is_a_no_op() {
    let backend = RamBackend::new(100);
    backend.discard(100, 10).unwrap();
    backend.discard(90, 100).unwrap();
}

#[test]
fn capabilities_cover_discard_and_write_zeroes() {
    let backend = RamBackend::new(1);
    let caps = backend.capabilities();
    assert!(caps.contains(Capabilities::DISCARD));
    assert!(caps.contains(Capabilities::WRITE_ZEROES));
    assert!(!caps.contains(Capabilities::FLUSH));
    assert!(backend.flush().is_err());
}
