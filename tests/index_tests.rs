//! Tests for the Block Index Table file format
//!
//! These tests verify:
//! - Builder -> search round trips across tree shapes
//! - Leaf-chain iteration in strictly ascending key order
//! - Authentication failure on a tampered node
//! - Strictly-ascending key enforcement in the builder

use std::sync::Arc;

use tempfile::TempDir;
use vaultdisk::crypto::{random_iv, random_key, Cipher, RingCipher};
use vaultdisk::device::BlockDevice;
use vaultdisk::index::bit::{file_region_blocks, BitBuilder};
use vaultdisk::index::level::LsmFile;
use vaultdisk::index::{Entry, Record};
use vaultdisk::VaultError;

// =============================================================================
// Helper Functions
// =============================================================================

const FILE_CAPACITY: u64 = 64;

fn setup() -> (TempDir, Arc<BlockDevice>, Arc<dyn Cipher>) {
    let dir = TempDir::new().unwrap();
    let blocks = file_region_blocks(FILE_CAPACITY) + 4;
    let device = Arc::new(BlockDevice::open(&dir.path().join("dev.img"), blocks).unwrap());
    (dir, device, Arc::new(RingCipher::new()))
}

fn entry(lba: u64) -> Entry {
    Entry {
        lba,
        record: Record {
            pba: lba * 10,
            key: random_key(),
            iv: random_iv(),
            mac: [0u8; 16],
        },
    }
}

fn build_file(
    device: &Arc<BlockDevice>,
    cipher: &Arc<dyn Cipher>,
    keys: &[u64],
) -> vaultdisk::index::bit::BitFile {
    let mut builder = BitBuilder::new(
        device.clone(),
        cipher.clone(),
        0,
        1,
        1,
        0,
        file_region_blocks(FILE_CAPACITY),
        FILE_CAPACITY,
    );
    for &lba in keys {
        builder.add(&entry(lba)).unwrap();
    }
    builder.complete().unwrap()
}

// =============================================================================
// Builder / Search Tests
// =============================================================================

#[test]
fn test_single_entry_file() {
    let (_dir, device, cipher) = setup();
    let file = build_file(&device, &cipher, &[42]);

    assert_eq!(file.first_key(), 42);
    assert_eq!(file.last_key(), 42);
    assert_eq!(file.search(42).unwrap().pba, 420);
    assert!(matches!(file.search(41), Err(VaultError::NotFound)));
}

#[test]
fn test_multi_level_search() {
    let (_dir, device, cipher) = setup();
    // odd keys only, spanning several inner-node levels
    let keys: Vec<u64> = (0..50).map(|i| i * 2 + 1).collect();
    let file = build_file(&device, &cipher, &keys);

    for &key in &keys {
        assert_eq!(file.search(key).unwrap().pba, key * 10);
    }
    // misses between, below, and above the present keys
    assert!(matches!(file.search(0), Err(VaultError::NotFound)));
    assert!(matches!(file.search(50), Err(VaultError::NotFound)));
    assert!(matches!(file.search(1000), Err(VaultError::NotFound)));
}

#[test]
fn test_exactly_full_file() {
    let (_dir, device, cipher) = setup();
    // capacity 64 = fan-out^2: the tree completes without a partial group
    let keys: Vec<u64> = (0..FILE_CAPACITY).collect();
    let file = build_file(&device, &cipher, &keys);

    for key in [0, 7, 8, 31, 63] {
        assert_eq!(file.search(key).unwrap().pba, key * 10);
    }
}

#[test]
fn test_builder_rejects_non_ascending_keys() {
    let (_dir, device, cipher) = setup();
    let mut builder = BitBuilder::new(
        device,
        cipher,
        0,
        0,
        1,
        0,
        file_region_blocks(FILE_CAPACITY),
        FILE_CAPACITY,
    );

    builder.add(&entry(10)).unwrap();
    assert!(matches!(
        builder.add(&entry(10)),
        Err(VaultError::InvalidState(_))
    ));
    assert!(matches!(
        builder.add(&entry(9)),
        Err(VaultError::InvalidState(_))
    ));
}

#[test]
fn test_builder_rejects_overflow() {
    let (_dir, device, cipher) = setup();
    let mut builder = BitBuilder::new(
        device,
        cipher,
        0,
        0,
        1,
        0,
        file_region_blocks(FILE_CAPACITY),
        FILE_CAPACITY,
    );

    for lba in 0..FILE_CAPACITY {
        builder.add(&entry(lba)).unwrap();
    }
    assert!(matches!(
        builder.add(&entry(FILE_CAPACITY)),
        Err(VaultError::OutOfSpace)
    ));
}

#[test]
fn test_empty_builder_cannot_complete() {
    let (_dir, device, cipher) = setup();
    let builder = BitBuilder::new(
        device,
        cipher,
        0,
        0,
        1,
        0,
        file_region_blocks(FILE_CAPACITY),
        FILE_CAPACITY,
    );
    assert!(matches!(
        builder.complete(),
        Err(VaultError::InvalidState(_))
    ));
}

// =============================================================================
// Iterator Tests
// =============================================================================

#[test]
fn test_iterator_yields_all_in_order() {
    let (_dir, device, cipher) = setup();
    let keys: Vec<u64> = (0..37).map(|i| i * 3).collect();
    let file = build_file(&device, &cipher, &keys);

    let yielded: Vec<u64> = file
        .iter()
        .unwrap()
        .map(|e| e.unwrap().lba)
        .collect();
    assert_eq!(yielded, keys);
}

#[test]
fn test_iterator_restartable() {
    let (_dir, device, cipher) = setup();
    let file = build_file(&device, &cipher, &[1, 2, 3]);

    let first_pass: Vec<u64> = file.iter().unwrap().map(|e| e.unwrap().lba).collect();
    let second_pass: Vec<u64> = file.iter().unwrap().map(|e| e.unwrap().lba).collect();
    assert_eq!(first_pass, second_pass);
}

#[test]
fn test_iterator_carries_records() {
    let (_dir, device, cipher) = setup();
    let file = build_file(&device, &cipher, &[5, 6, 7]);

    for item in file.iter().unwrap() {
        let entry = item.unwrap();
        assert_eq!(entry.record.pba, entry.lba * 10);
    }
}

// =============================================================================
// Tamper Tests
// =============================================================================

#[test]
fn test_tampered_node_fails_search() {
    let (_dir, device, cipher) = setup();
    let keys: Vec<u64> = (0..FILE_CAPACITY).collect();
    let file = build_file(&device, &cipher, &keys);

    // flip one byte somewhere inside the node region
    let mut buf = vec![0u8; 1];
    device.read_at(600, &mut buf).unwrap();
    buf[0] ^= 0x80;
    device.write_at(600, &buf).unwrap();

    // with every node now suspect, at least one key's descent must hit the
    // damaged slot and die with AuthFailure rather than a wrong answer
    let failures = keys
        .iter()
        .filter(|&&k| matches!(file.search(k), Err(VaultError::AuthFailure)))
        .count();
    assert!(failures > 0);
}
