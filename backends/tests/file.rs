// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io::Write;
use std::path::PathBuf;

use backends::{Backend, Capabilities, FileBackend};

struct TempFile {
    path: PathBuf,
}

impl TempFile {
    fn with_len(name: &str, len: u64) -> Self {
        let path = std::env::temp_dir().join(format!("backends-test-{}-{}", std::process::id(), name));
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(len).unwrap();
        Self { path }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[test]
fn round_trip_and_flush() {
    let tmp = TempFile::with_len("round-trip", 4096);
    let backend = FileBackend::open(&tmp.path).unwrap();
    assert_eq!(backend.size(), 4096);

    let payload = b"file backend payload";
    assert_eq!(backend.write_at(payload, 512).unwrap(), payload.len());
    backend.flush().unwrap();

    let mut buf = vec![0; payload.len()];
    assert_eq!(backend.read_at(&mut buf, 512).unwrap(), payload.len());
    assert_eq!(&buf, payload);
}

#[test]
fn boundary_behaviour_matches_the_backend_contract() {
    let tmp = TempFile::with_len("boundary", 100);
    let backend = FileBackend::open(&tmp.path).unwrap();

    let mut buf = [0_u8; 50];
    assert_eq!(backend.read_at(&mut buf, 80).unwrap(), 20);
    assert_eq!(backend.read_at(&mut buf, 100).unwrap(), 0);

    assert!(backend.write_at(b"oops", 101).is_err());
    assert_eq!(backend.write_at(&[1; 8], 96).unwrap(), 4);
}

#[test]
fn size_is_captured_at_open() {
    let tmp = TempFile::with_len("size-pin", 1024);
    {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&tmp.path)
            .unwrap();
        file.write_all(&[7; 16]).unwrap();
    }

    let backend = FileBackend::open(&tmp.path).unwrap();
    assert_eq!(backend.size(), 1024);
    assert!(backend.capabilities().contains(Capabilities::FLUSH));
}
