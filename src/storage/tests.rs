use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use super::*;
use crate::metainfo::{FileEntry, Info};

fn two_file_info() -> Info {
    Info {
        name: "pair".into(),
        piece_length: 16,
        piece_hashes: vec![[0u8; 20]; 3],
        files: vec![
            FileEntry {
                path: PathBuf::from("pair/a.bin"),
                length: 20,
                offset: 0,
            },
            FileEntry {
                path: PathBuf::from("pair/b.bin"),
                length: 20,
                offset: 20,
            },
        ],
        total_length: 40,
        private: false,
    }
}

#[test]
fn test_file_storage_write_read_across_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path(), &two_file_info()).unwrap();

    // Piece 1 (offsets 16..32) straddles the file boundary at 20.
    storage.write_chunk(1, 0, &[0xaa; 16]).unwrap();

    let mut buf = [0u8; 16];
    let n = storage.read_at(16, &mut buf).unwrap();
    assert_eq!(n, 16);
    assert_eq!(buf, [0xaa; 16]);

    // The tail of file a and head of file b both carry the data.
    let mut head = [0u8; 4];
    assert_eq!(storage.read_at(16, &mut head).unwrap(), 4);
    assert_eq!(head, [0xaa; 4]);
}

#[test]
fn test_file_storage_read_past_end() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path(), &two_file_info()).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(storage.read_at(40, &mut buf).unwrap(), 0);
    // Short read at the boundary.
    assert_eq!(storage.read_at(36, &mut buf).unwrap(), 4);
}

#[test]
fn test_file_storage_rejects_out_of_bounds_write() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path(), &two_file_info()).unwrap();
    assert!(matches!(
        storage.write_chunk(2, 8, &[0u8; 16]),
        Err(StorageError::OutOfBounds { .. })
    ));
}

#[test]
fn test_file_storage_section_reader() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path(), &two_file_info()).unwrap();
    storage.write_chunk(0, 0, &[1u8; 16]).unwrap();
    storage.write_chunk(1, 0, &[2u8; 16]).unwrap();

    let mut section = storage.open_section(8, 16).unwrap().unwrap();
    let mut out = Vec::new();
    section.read_to_end(&mut out).unwrap();
    assert_eq!(out.len(), 16);
    assert_eq!(&out[..8], &[1u8; 8]);
    assert_eq!(&out[8..], &[2u8; 8]);
}

#[test]
fn test_memory_storage_round_trip() {
    let storage = MemoryStorage::new(16, 40);
    storage.write_chunk(0, 0, &[7u8; 16]).unwrap();
    storage.write_chunk(2, 0, &[9u8; 8]).unwrap();

    let mut buf = [0u8; 12];
    assert_eq!(storage.read_at(0, &mut buf).unwrap(), 12);
    assert_eq!(buf, [7u8; 12]);

    // Unwritten pieces read as zeros.
    let mut buf = [1u8; 4];
    assert_eq!(storage.read_at(16, &mut buf).unwrap(), 4);
    assert_eq!(buf, [0u8; 4]);
}

#[test]
fn test_memory_storage_capacity_budget() {
    let capacity = Arc::new(Capacity::new(32));
    let storage = MemoryStorage::new(16, 64).with_capacity(Arc::clone(&capacity));

    storage.write_chunk(0, 0, &[1u8; 16]).unwrap();
    storage.write_chunk(1, 0, &[1u8; 16]).unwrap();
    assert_eq!(capacity.remaining(), 0);
    assert!(matches!(
        storage.write_chunk(2, 0, &[1u8; 16]),
        Err(StorageError::CapacityExhausted)
    ));

    capacity.release(16);
    storage.write_chunk(2, 0, &[1u8; 16]).unwrap();
}

#[test]
fn test_memory_storage_commit_hook() {
    let storage = MemoryStorage::new(16, 16).with_commit_hook(Box::new(|index| {
        if index == 0 {
            Err(StorageError::CommitRejected(index, "disk full".into()))
        } else {
            Ok(())
        }
    }));
    let completion = storage.completion().unwrap();
    assert!(completion.piece_completed(0).is_err());
    assert!(completion.piece_completed(1).is_ok());
}

#[test]
fn test_capacity_counter() {
    let capacity = Capacity::new(100);
    assert!(capacity.try_consume(60));
    assert!(!capacity.try_consume(50));
    assert_eq!(capacity.remaining(), 40);
    capacity.release(60);
    assert_eq!(capacity.remaining(), 100);
    // Release never underflows.
    capacity.release(1_000);
    assert_eq!(capacity.remaining(), 100);
}
