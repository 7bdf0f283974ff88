//! Two devices sharing one drive

use seqvault::crypto::KdfParams;
use seqvault::prelude::*;
use seqvault::sequence::SequenceStatus;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Arc;
use tempfile::TempDir;

fn settings() -> DriveSettings {
    DriveSettings {
        default_chunk_size: 128,
        kdf: KdfParams::insecure_fast(),
        ..DriveSettings::default()
    }
}

fn device(dir: &TempDir, name: &str) -> Arc<dyn NonceSequencer> {
    Arc::new(FileSequencer::new(dir.path().join(name).join("sequences.json")).unwrap())
}

fn range(drive: &Drive) -> (u64, u64) {
    let sequence = drive.sequence().unwrap().unwrap();
    (sequence.next_nonce.unwrap(), sequence.max_nonce.unwrap())
}

#[test]
fn test_grant_splits_range_disjointly() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("drive");

    let a = Drive::create(&root, b"shared", device(&dir, "a"), settings()).unwrap();
    let b = Drive::open(&root, b"shared", device(&dir, "b"), settings()).unwrap();

    // Use up a few nonces on A first
    for i in 0..3 {
        let mut w = a.create_file(&format!("a{}", i), StreamOptions::default()).unwrap();
        w.write_all(b"from a").unwrap();
        w.finish().unwrap();
    }

    let target = b.auth_id().unwrap();
    let export = dir.path().join("grant.sqva");
    a.export_auth_file(&target, &export).unwrap();

    // A drew one nonce for the grant file before splitting
    let (a_next, a_max) = range(&a);
    assert_eq!(a_next, 4);

    b.import_auth_file(&export).unwrap();
    let (b_next, b_max) = range(&b);

    assert_eq!(a_max, b_next);
    assert_eq!(b_max, u64::MAX);
    assert!(a_next < a_max);
    assert_eq!(b.sequence().unwrap().unwrap().status, SequenceStatus::Active);
}

#[test]
fn test_devices_never_share_a_nonce() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("drive");

    let a = Drive::create(&root, b"shared", device(&dir, "a"), settings()).unwrap();
    let b = Drive::open(&root, b"shared", device(&dir, "b"), settings()).unwrap();
    let c = Drive::open(&root, b"shared", device(&dir, "c"), settings()).unwrap();

    let grant_b = dir.path().join("b.sqva");
    a.export_auth_file(&b.auth_id().unwrap(), &grant_b).unwrap();
    b.import_auth_file(&grant_b).unwrap();

    // B subdivides its own half for C
    let grant_c = dir.path().join("c.sqva");
    b.export_auth_file(&c.auth_id().unwrap(), &grant_c).unwrap();
    c.import_auth_file(&grant_c).unwrap();

    let ranges = [range(&a), range(&b), range(&c)];
    for (i, x) in ranges.iter().enumerate() {
        for y in &ranges[i + 1..] {
            assert!(x.1 <= y.0 || y.1 <= x.0, "ranges {:?} and {:?} overlap", x, y);
        }
    }

    let mut seen = HashSet::new();
    for _ in 0..20 {
        for drive in [&a, &b, &c] {
            let nonce = drive.next_nonce().unwrap();
            assert!(seen.insert(nonce), "nonce issued twice");
        }
    }
}

#[test]
fn test_files_written_by_recipient_readable_by_grantor() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("drive");

    let a = Drive::create(&root, b"shared", device(&dir, "a"), settings()).unwrap();
    let b = Drive::open(&root, b"shared", device(&dir, "b"), settings()).unwrap();

    let grant = a.export_path();
    a.export_auth_file(&b.auth_id().unwrap(), &grant).unwrap();
    b.import_auth_file(&grant).unwrap();

    let data: Vec<u8> = (0..1000u32).map(|i| (i * 13 % 256) as u8).collect();
    let mut writer = b.create_file("notes/shared.bin", StreamOptions::default()).unwrap();
    writer.write_all(&data).unwrap();
    writer.finish().unwrap();

    let mut out = Vec::new();
    a.open_file("notes/shared.bin", StreamOptions::default())
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    assert_eq!(out, data);
}

#[test]
fn test_revoked_device_cannot_write() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("drive");
    let a = Drive::create(&root, b"shared", device(&dir, "a"), settings()).unwrap();

    a.revoke_authorization().unwrap();
    let err = a.create_file("late", StreamOptions::default()).unwrap_err();
    assert!(matches!(err, Error::NotAuthorized { .. }));
}
