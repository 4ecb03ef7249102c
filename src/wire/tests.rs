use bytes::Bytes;

use super::*;

// R2: decode(encode(m)) == m for every message kind.
#[test]
fn test_round_trip_every_kind() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { index: 42 },
        Message::Bitfield(Bytes::from_static(&[0xaa, 0x55, 0x80])),
        Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Piece {
            index: 3,
            begin: 0,
            data: Bytes::from_static(b"chunk data"),
        },
        Message::Cancel {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Port(6881),
        Message::SuggestPiece { index: 9 },
        Message::HaveAll,
        Message::HaveNone,
        Message::RejectRequest {
            index: 2,
            begin: 32768,
            length: 16384,
        },
        Message::AllowedFast { index: 7 },
        Message::Extended {
            id: 1,
            payload: Bytes::from_static(b"d8:msg_typei0e5:piecei3ee"),
        },
    ];

    for msg in messages {
        let encoded = msg.encode();
        assert_eq!(encoded.len(), msg.frame_len(), "frame_len for {msg:?}");
        let payload = Bytes::copy_from_slice(&encoded[4..]);
        let decoded = Message::decode(payload).unwrap();
        assert_eq!(decoded, msg);
    }
}

#[test]
fn test_decode_rejects_unknown_id() {
    let payload = Bytes::from_static(&[99, 0, 0, 0, 0]);
    assert!(matches!(
        Message::decode(payload),
        Err(WireError::UnknownMessageId(99))
    ));
}

#[test]
fn test_decode_rejects_short_payload() {
    // A Request with only 8 payload bytes after the id.
    let payload = Bytes::from_static(&[6, 0, 0, 0, 1, 0, 0, 0]);
    assert!(matches!(
        Message::decode(payload),
        Err(WireError::ShortPayload(_))
    ));
}

#[tokio::test]
async fn test_codec_over_stream() {
    let (mut a, mut b) = tokio::io::duplex(64 * 1024);
    let mut tx = MessageCodec::new();
    let mut rx = MessageCodec::new();

    let sent = vec![
        Message::HaveNone,
        Message::Have { index: 5 },
        Message::Piece {
            index: 5,
            begin: 0,
            data: Bytes::from(vec![7u8; 16384]),
        },
        Message::KeepAlive,
    ];
    for msg in &sent {
        tx.write_message(&mut a, msg).await.unwrap();
    }

    for expected in &sent {
        let got = rx.read_message(&mut b).await.unwrap();
        assert_eq!(&got, expected);
    }
}

#[tokio::test]
async fn test_oversized_frame_is_fatal() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    let mut rx = MessageCodec::with_max_frame_len(64);

    use tokio::io::AsyncWriteExt;
    a.write_all(&1_000_000u32.to_be_bytes()).await.unwrap();

    match rx.read_message(&mut b).await {
        Err(WireError::FrameTooLarge(len)) => assert_eq!(len, 1_000_000),
        other => panic!("expected FrameTooLarge, got {other:?}"),
    }
}

#[tokio::test]
async fn test_peer_hangup_is_closed() {
    let (a, mut b) = tokio::io::duplex(64);
    drop(a);
    let mut rx = MessageCodec::new();
    assert!(matches!(
        rx.read_message(&mut b).await,
        Err(WireError::Closed)
    ));
}
