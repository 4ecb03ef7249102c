use std::collections::BTreeMap;

use bytes::Bytes;

use super::*;

#[test]
fn test_decode_primitives() {
    assert_eq!(from_bytes(b"i42e").unwrap(), Value::Int(42));
    assert_eq!(from_bytes(b"i-7e").unwrap(), Value::Int(-7));
    assert_eq!(from_bytes(b"i0e").unwrap(), Value::Int(0));
    assert_eq!(from_bytes(b"4:spam").unwrap(), Value::text("spam"));
    assert_eq!(from_bytes(b"0:").unwrap(), Value::text(""));
}

#[test]
fn test_decode_rejects_noncanonical_integers() {
    assert_eq!(from_bytes(b"i-0e"), Err(BencodeError::BadInteger));
    assert_eq!(from_bytes(b"i03e"), Err(BencodeError::BadInteger));
    assert_eq!(from_bytes(b"ie"), Err(BencodeError::BadInteger));
}

#[test]
fn test_decode_collections() {
    let list = from_bytes(b"l4:spami42ee").unwrap();
    assert_eq!(
        list,
        Value::List(vec![Value::text("spam"), Value::Int(42)])
    );

    let dict = from_bytes(b"d3:bar4:spam3:fooi42ee").unwrap();
    assert_eq!(dict.get(b"foo").and_then(Value::as_int), Some(42));
    assert_eq!(dict.get(b"bar").and_then(Value::as_text), Some("spam"));
}

#[test]
fn test_decode_truncated_and_trailing() {
    assert_eq!(from_bytes(b"i42"), Err(BencodeError::Truncated));
    assert_eq!(from_bytes(b"5:spam"), Err(BencodeError::Truncated));
    assert_eq!(from_bytes(b"i42ei2e"), Err(BencodeError::TrailingData));
    assert_eq!(from_bytes(b"d3:fooe"), Err(BencodeError::Truncated));
}

#[test]
fn test_dict_keys_must_be_strings() {
    assert_eq!(from_bytes(b"di1ei2ee"), Err(BencodeError::NonStringKey));
}

#[test]
fn test_nesting_limit() {
    let mut deep = Vec::new();
    deep.extend(std::iter::repeat(b'l').take(100));
    deep.extend(std::iter::repeat(b'e').take(100));
    assert_eq!(from_bytes(&deep), Err(BencodeError::TooDeep));
}

// R3: unmarshal(marshal(v)) == v over representative domain values.
#[test]
fn test_round_trip() {
    let mut info = BTreeMap::new();
    info.insert(Bytes::from_static(b"length"), Value::Int(262144));
    info.insert(Bytes::from_static(b"name"), Value::text("ubuntu.iso"));
    info.insert(
        Bytes::from_static(b"pieces"),
        Value::Str(Bytes::from(vec![0xabu8; 40])),
    );

    let mut top = BTreeMap::new();
    top.insert(
        Bytes::from_static(b"announce"),
        Value::text("http://tracker.example.com/announce"),
    );
    top.insert(
        Bytes::from_static(b"announce-list"),
        Value::List(vec![Value::List(vec![
            Value::text("udp://a.example/ann"),
            Value::text("http://b.example/ann"),
        ])]),
    );
    top.insert(Bytes::from_static(b"info"), Value::Dict(info));

    let value = Value::Dict(top);
    let encoded = to_bytes(&value);
    assert_eq!(from_bytes(&encoded).unwrap(), value);
}

#[test]
fn test_canonical_key_order() {
    let mut map = BTreeMap::new();
    map.insert(Bytes::from_static(b"zz"), Value::Int(1));
    map.insert(Bytes::from_static(b"aa"), Value::Int(2));
    let encoded = to_bytes(&Value::Dict(map));
    assert_eq!(encoded, b"d2:aai2e2:zzi1ee");
}

#[test]
fn test_value_len_with_trailing_payload() {
    // A ut_metadata data frame: bencoded dict immediately followed by raw bytes.
    let mut frame = b"d8:msg_typei1e5:piecei0e10:total_sizei27ee".to_vec();
    let dict_len = frame.len();
    frame.extend_from_slice(b"raw piece bytes follow here");

    assert_eq!(value_len(&frame).unwrap(), dict_len);
    let dict = from_bytes(&frame[..dict_len]).unwrap();
    assert_eq!(dict.get(b"msg_type").and_then(Value::as_int), Some(1));
}
