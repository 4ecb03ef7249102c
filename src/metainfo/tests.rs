use super::*;
use crate::bencode::{from_bytes, to_bytes, Value};
use bytes::Bytes;
use std::collections::BTreeMap;

fn single_file_torrent(name: &str, piece_length: i64, length: i64) -> Vec<u8> {
    let num_pieces = (length as u64).div_ceil(piece_length as u64) as usize;
    let mut info = BTreeMap::new();
    info.insert(Bytes::from_static(b"name"), Value::text(name));
    info.insert(Bytes::from_static(b"piece length"), Value::Int(piece_length));
    info.insert(Bytes::from_static(b"length"), Value::Int(length));
    info.insert(
        Bytes::from_static(b"pieces"),
        Value::Str(Bytes::from(vec![0x11u8; 20 * num_pieces])),
    );

    let mut top = BTreeMap::new();
    top.insert(
        Bytes::from_static(b"announce"),
        Value::text("http://tracker.example.com/announce"),
    );
    top.insert(Bytes::from_static(b"info"), Value::Dict(info));
    to_bytes(&Value::Dict(top))
}

#[test]
fn test_parse_single_file() {
    let data = single_file_torrent("linux.iso", 16384, 100_000);
    let mi = Metainfo::from_bytes(&data).unwrap();

    assert_eq!(mi.info.name, "linux.iso");
    assert_eq!(mi.info.piece_length, 16384);
    assert_eq!(mi.info.total_length, 100_000);
    assert_eq!(mi.info.num_pieces(), 7);
    assert_eq!(mi.info.files.len(), 1);
    assert_eq!(
        mi.announce_list,
        vec![vec!["http://tracker.example.com/announce".to_string()]]
    );
}

#[test]
fn test_piece_len_final_piece_short() {
    let data = single_file_torrent("x", 16384, 100_000);
    let mi = Metainfo::from_bytes(&data).unwrap();

    assert_eq!(mi.info.piece_len(0), 16384);
    // 100_000 = 6 * 16384 + 1696
    assert_eq!(mi.info.piece_len(6), 1696);
}

#[test]
fn test_info_hash_matches_raw_info() {
    let data = single_file_torrent("x", 16384, 16384);
    let mi = Metainfo::from_bytes(&data).unwrap();
    assert_eq!(mi.info_hash, InfoHash::of_info_dict(mi.raw_info()));
}

#[test]
fn test_multi_file_offsets() {
    let mut info = BTreeMap::new();
    info.insert(Bytes::from_static(b"name"), Value::text("album"));
    info.insert(Bytes::from_static(b"piece length"), Value::Int(32768));
    info.insert(
        Bytes::from_static(b"pieces"),
        Value::Str(Bytes::from(vec![0u8; 20])),
    );
    let file = |n: &str, len: i64| {
        let mut d = BTreeMap::new();
        d.insert(Bytes::from_static(b"length"), Value::Int(len));
        d.insert(
            Bytes::from_static(b"path"),
            Value::List(vec![Value::text(n)]),
        );
        Value::Dict(d)
    };
    info.insert(
        Bytes::from_static(b"files"),
        Value::List(vec![file("a.mp3", 10_000), file("b.mp3", 20_000)]),
    );
    let mut top = BTreeMap::new();
    top.insert(Bytes::from_static(b"info"), Value::Dict(info));
    let data = to_bytes(&Value::Dict(top));

    let mi = Metainfo::from_bytes(&data).unwrap();
    assert_eq!(mi.info.total_length, 30_000);
    assert_eq!(mi.info.files[0].offset, 0);
    assert_eq!(mi.info.files[1].offset, 10_000);
    assert!(mi.info.files[1].path.ends_with("b.mp3"));
}

#[test]
fn test_rejects_path_traversal() {
    let mut info = BTreeMap::new();
    info.insert(Bytes::from_static(b"name"), Value::text("evil"));
    info.insert(Bytes::from_static(b"piece length"), Value::Int(32768));
    info.insert(
        Bytes::from_static(b"pieces"),
        Value::Str(Bytes::from(vec![0u8; 20])),
    );
    let mut entry = BTreeMap::new();
    entry.insert(Bytes::from_static(b"length"), Value::Int(10));
    entry.insert(
        Bytes::from_static(b"path"),
        Value::List(vec![Value::text(".."), Value::text("passwd")]),
    );
    info.insert(
        Bytes::from_static(b"files"),
        Value::List(vec![Value::Dict(entry)]),
    );
    let mut top = BTreeMap::new();
    top.insert(Bytes::from_static(b"info"), Value::Dict(info));
    let data = to_bytes(&Value::Dict(top));

    assert!(Metainfo::from_bytes(&data).is_err());
}

#[test]
fn test_info_hash_hex_round_trip() {
    let ih = InfoHash([0xc1; 20]);
    let hex = ih.to_hex();
    assert_eq!(hex.len(), 40);
    assert_eq!(InfoHash::from_hex(&hex).unwrap(), ih);
}

#[test]
fn test_magnet_parse_hex() {
    let magnet = MagnetLink::parse(
        "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a\
         &dn=Example%20Name&tr=http%3A%2F%2Ftracker.example.com%2Fannounce",
    )
    .unwrap();

    assert_eq!(
        magnet.info_hash.to_hex(),
        "c12fe1c06bba254a9dc9f519b335aa7c1367a88a"
    );
    assert_eq!(magnet.display_name.as_deref(), Some("Example Name"));
    assert_eq!(
        magnet.trackers,
        vec!["http://tracker.example.com/announce".to_string()]
    );
}

#[test]
fn test_magnet_requires_xt() {
    assert!(MagnetLink::parse("magnet:?dn=nothing").is_err());
    assert!(MagnetLink::parse("http://example.com").is_err());
}

#[test]
fn test_metainfo_cache_round_trip() {
    let data = single_file_torrent("cached", 16384, 16384);
    let mi = Metainfo::from_bytes(&data).unwrap();
    let reparsed = Metainfo::from_bytes(&mi.to_bytes()).unwrap();
    assert_eq!(reparsed.info_hash, mi.info_hash);
    assert_eq!(reparsed.info.name, "cached");
    assert_eq!(reparsed.announce_list, mi.announce_list);
}

#[test]
fn test_info_from_dict_bytes() {
    let data = single_file_torrent("x", 16384, 16384);
    let mi = Metainfo::from_bytes(&data).unwrap();
    let info = Info::from_dict_bytes(mi.raw_info()).unwrap();
    assert_eq!(info.name, "x");
    assert_eq!(info.num_pieces(), 1);
}

#[test]
fn test_bencode_value_round_trip_via_metainfo() {
    let data = single_file_torrent("rt", 16384, 16384);
    let value = from_bytes(&data).unwrap();
    assert_eq!(from_bytes(&to_bytes(&value)).unwrap(), value);
}
