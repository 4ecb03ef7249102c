use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;

use super::http::{build_url, parse_response};
use super::*;
use crate::bencode::{to_bytes, Value};
use crate::metainfo::InfoHash;

fn request() -> AnnounceRequest {
    AnnounceRequest {
        info_hash: InfoHash([0xab; 20]),
        peer_id: *b"-SH0001-abcdefghijkl",
        port: 6881,
        uploaded: 1024,
        downloaded: 2048,
        left: 4096,
        event: AnnounceEvent::Started,
        num_want: None,
    }
}

#[test]
fn test_unknown_scheme_is_typed_error() {
    assert!(matches!(
        TrackerClient::new("wss://tracker.example/announce"),
        Err(TrackerError::BadScheme(_))
    ));
    assert!(TrackerClient::new("http://tracker.example/announce").is_ok());
    assert!(TrackerClient::new("udp://tracker.example:6969").is_ok());
}

#[test]
fn test_host_extraction() {
    let client = TrackerClient::new("http://tracker.example.com:8080/announce").unwrap();
    assert_eq!(client.host(), Some("tracker.example.com"));
    let client = TrackerClient::new("udp://10.0.0.1:6969").unwrap();
    assert_eq!(client.host(), Some("10.0.0.1"));
}

#[test]
fn test_announce_url_params() {
    let url = build_url("http://t.example/announce", &request());
    assert!(url.starts_with("http://t.example/announce?"));
    assert!(url.contains("info_hash=%ab%ab"));
    assert!(url.contains("peer_id=-SH0001-abcdefghijkl"));
    assert!(url.contains("port=6881"));
    assert!(url.contains("uploaded=1024"));
    assert!(url.contains("downloaded=2048"));
    assert!(url.contains("left=4096"));
    assert!(url.contains("compact=1"));
    assert!(url.contains("event=started"));

    let mut stopped = request();
    stopped.event = AnnounceEvent::None;
    stopped.num_want = Some(30);
    let url = build_url("http://t.example/announce", &stopped);
    assert!(!url.contains("event="));
    assert!(url.contains("numwant=30"));
}

#[test]
fn test_parse_compact_response() {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"interval"), Value::Int(1800));
    dict.insert(Bytes::from_static(b"complete"), Value::Int(10));
    dict.insert(Bytes::from_static(b"incomplete"), Value::Int(3));
    // Two peers: 1.2.3.4:257 and 10.0.0.1:6881
    dict.insert(
        Bytes::from_static(b"peers"),
        Value::Str(Bytes::from_static(&[
            1, 2, 3, 4, 0x01, 0x01, 10, 0, 0, 1, 0x1a, 0xe1,
        ])),
    );
    let body = to_bytes(&Value::Dict(dict));

    let response = parse_response(&body).unwrap();
    assert_eq!(response.interval, 1800);
    assert_eq!(response.complete, Some(10));
    assert_eq!(response.incomplete, Some(3));
    assert_eq!(
        response.peers,
        vec![
            "1.2.3.4:257".parse::<SocketAddr>().unwrap(),
            "10.0.0.1:6881".parse::<SocketAddr>().unwrap(),
        ]
    );
}

#[test]
fn test_parse_dict_peer_list() {
    let peer = |ip: &str, port: i64| {
        let mut d = BTreeMap::new();
        d.insert(Bytes::from_static(b"ip"), Value::text(ip));
        d.insert(Bytes::from_static(b"port"), Value::Int(port));
        Value::Dict(d)
    };
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"interval"), Value::Int(60));
    dict.insert(
        Bytes::from_static(b"peers"),
        Value::List(vec![peer("192.168.1.9", 51413), peer("2001:db8::1", 6881)]),
    );
    let body = to_bytes(&Value::Dict(dict));

    let response = parse_response(&body).unwrap();
    assert_eq!(response.peers.len(), 2);
    assert_eq!(response.peers[0], "192.168.1.9:51413".parse().unwrap());
    assert_eq!(response.peers[1], "[2001:db8::1]:6881".parse().unwrap());
}

#[test]
fn test_failure_reason() {
    let mut dict = BTreeMap::new();
    dict.insert(
        Bytes::from_static(b"failure reason"),
        Value::text("unregistered torrent"),
    );
    let body = to_bytes(&Value::Dict(dict));
    assert!(matches!(
        parse_response(&body),
        Err(TrackerError::Failure(reason)) if reason == "unregistered torrent"
    ));
}

#[test]
fn test_compact_peers6() {
    let mut raw = Vec::new();
    raw.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
    raw.extend_from_slice(&6881u16.to_be_bytes());
    let peers = parse_compact_peers6(&raw);
    assert_eq!(peers, vec!["[2001:db8::1]:6881".parse().unwrap()]);
}

// BEP-15 announce packets have a fixed layout; check the prefix bytes.
#[tokio::test]
async fn test_udp_announce_packet_layout() {
    use tokio::net::UdpSocket;

    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        // Connect request.
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 16);
        assert_eq!(&buf[..8], &0x41727101980u64.to_be_bytes());
        assert_eq!(&buf[8..12], &0u32.to_be_bytes());
        let transaction = &buf[12..16].to_vec();

        let mut reply = Vec::new();
        reply.extend_from_slice(&0u32.to_be_bytes());
        reply.extend_from_slice(transaction);
        reply.extend_from_slice(&0xfeedfacecafeb33fu64.to_be_bytes());
        server.send_to(&reply, from).await.unwrap();

        // Announce request.
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 98);
        assert_eq!(&buf[..8], &0xfeedfacecafeb33fu64.to_be_bytes());
        assert_eq!(&buf[8..12], &1u32.to_be_bytes());
        assert_eq!(&buf[16..36], &[0xab; 20]);
        assert_eq!(&buf[36..56], b"-SH0001-abcdefghijkl");
        let transaction = buf[12..16].to_vec();

        let mut reply = Vec::new();
        reply.extend_from_slice(&1u32.to_be_bytes());
        reply.extend_from_slice(&transaction);
        reply.extend_from_slice(&900u32.to_be_bytes()); // interval
        reply.extend_from_slice(&5u32.to_be_bytes()); // leechers
        reply.extend_from_slice(&7u32.to_be_bytes()); // seeders
        reply.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        server.send_to(&reply, from).await.unwrap();
    });

    let client = TrackerClient::new(&format!("udp://{}", addr)).unwrap();
    let response = client.announce(&request()).await.unwrap();
    assert_eq!(response.interval, 900);
    assert_eq!(response.complete, Some(7));
    assert_eq!(response.incomplete, Some(5));
    assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);

    server_task.await.unwrap();
}
