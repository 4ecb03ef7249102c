use std::time::Duration;

use bytes::Bytes;

use super::*;
use crate::metainfo::InfoHash;
use crate::pieces::Request;
use crate::scheduler::PeerRequestState;
use crate::wire::{Message, MessageCodec};

fn test_session() -> PeerSession {
    PeerSession::new(
        "10.0.0.9:6881".parse().unwrap(),
        TransportKind::Tcp,
        Direction::Outgoing,
        false,
        PeerId::generate(),
        ReservedBits::ours(),
        MessageQueue::new(),
    )
}

#[test]
fn test_handshake_encode_decode() {
    let ours = Handshake {
        reserved: ReservedBits::ours(),
        info_hash: InfoHash([3; 20]),
        peer_id: PeerId::generate(),
    };
    let decoded = Handshake::decode(&ours.encode()).unwrap();
    assert_eq!(decoded.info_hash, ours.info_hash);
    assert_eq!(decoded.peer_id, ours.peer_id);
    assert!(decoded.reserved.supports_extended());
    assert!(decoded.reserved.supports_dht());
    assert!(decoded.reserved.supports_fast());
}

#[test]
fn test_handshake_rejects_wrong_protocol() {
    let mut raw = Handshake {
        reserved: ReservedBits::default(),
        info_hash: InfoHash([0; 20]),
        peer_id: PeerId::generate(),
    }
    .encode();
    raw[1] = b'X';
    assert!(Handshake::decode(&raw).is_err());
}

#[tokio::test]
async fn test_exchange_handshake_both_directions() {
    let info_hash = InfoHash([7; 20]);
    let dialer_id = PeerId::generate();
    let listener_id = PeerId::generate();
    let (mut a, mut b) = tokio::io::duplex(1024);

    let dialer = tokio::spawn(async move {
        exchange_handshake(&mut a, Some(info_hash), dialer_id, |_| true)
            .await
            .unwrap()
    });
    let listener = tokio::spawn(async move {
        exchange_handshake(&mut b, None, listener_id, |hs| {
            hs.info_hash == info_hash
        })
        .await
        .unwrap()
    });

    let seen_by_dialer = dialer.await.unwrap();
    let seen_by_listener = listener.await.unwrap();
    assert_eq!(seen_by_dialer.peer_id, listener_id);
    assert_eq!(seen_by_listener.peer_id, dialer_id);
    assert_eq!(seen_by_listener.info_hash, info_hash);
}

#[tokio::test]
async fn test_exchange_handshake_infohash_mismatch() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    let dialer = tokio::spawn(async move {
        exchange_handshake(&mut a, Some(InfoHash([1; 20])), PeerId::generate(), |_| true).await
    });
    let listener = tokio::spawn(async move {
        exchange_handshake(&mut b, None, PeerId::generate(), |_| false).await
    });
    assert!(matches!(
        listener.await.unwrap(),
        Err(PeerError::InfoHashMismatch)
    ));
    let _ = dialer.await.unwrap();
}

#[test]
fn test_queue_cancel_removes_queued_request() {
    let queue = MessageQueue::new();
    queue.post(Message::Request {
        index: 4,
        begin: 0,
        length: 16384,
    });
    queue.post(Message::Request {
        index: 5,
        begin: 0,
        length: 16384,
    });
    // Cancels the queued request in place: neither hits the wire.
    queue.post(Message::Cancel {
        index: 4,
        begin: 0,
        length: 16384,
    });
    assert_eq!(
        queue.queued(),
        vec![Message::Request {
            index: 5,
            begin: 0,
            length: 16384
        }]
    );

    // A cancel with no queued request is sent through.
    queue.post(Message::Cancel {
        index: 9,
        begin: 0,
        length: 16384,
    });
    assert_eq!(queue.len(), 2);
}

#[test]
fn test_queue_have_folds_into_bitfield() {
    let queue = MessageQueue::new();
    queue.post(Message::Bitfield(Bytes::from_static(&[0x80, 0x00])));
    queue.post(Message::Have { index: 9 });
    let queued = queue.queued();
    assert_eq!(queued.len(), 1);
    match &queued[0] {
        Message::Bitfield(bits) => assert_eq!(&bits[..], &[0x80, 0x40]),
        other => panic!("expected folded bitfield, got {other:?}"),
    }

    // Without a queued bitfield the have goes out as-is.
    let queue = MessageQueue::new();
    queue.post(Message::Have { index: 1 });
    assert_eq!(queue.queued(), vec![Message::Have { index: 1 }]);
}

#[tokio::test]
async fn test_writer_drains_and_keepalives() {
    let (sink, mut source) = tokio::io::duplex(64 * 1024);
    let queue = MessageQueue::new();
    queue.post(Message::Interested);

    let writer = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.run_writer(sink, Duration::from_millis(50)).await })
    };

    let mut codec = MessageCodec::new();
    assert_eq!(
        codec.read_message(&mut source).await.unwrap(),
        Message::Interested
    );
    // Idle long enough and a keep-alive shows up unprompted.
    assert_eq!(
        codec.read_message(&mut source).await.unwrap(),
        Message::KeepAlive
    );

    queue.post(Message::Unchoke);
    assert_eq!(
        codec.read_message(&mut source).await.unwrap(),
        Message::Unchoke
    );

    queue.close();
    writer.await.unwrap().unwrap();
}

#[test]
fn test_choke_clears_requests_keeps_interest() {
    let mut session = test_session();
    session.interested = true;
    session.peer_choking = false;
    session.requests.insert(Request::new(0, 0, 16384));
    session.requests.insert(Request::new(0, 16384, 16384));

    let events = session.handle_message(Message::Choke).unwrap();
    assert!(session.peer_choking);
    assert!(session.interested);
    assert!(session.requests.is_empty());
    match &events[..] {
        [SessionEvent::RequestsCleared(cleared)] => assert_eq!(cleared.len(), 2),
        other => panic!("unexpected events {other:?}"),
    }
}

#[test]
fn test_second_bitfield_is_fatal() {
    let mut session = test_session();
    session.known_pieces = Some(8);
    session
        .handle_message(Message::Bitfield(Bytes::from_static(&[0xff])))
        .unwrap();
    assert!(matches!(
        session.handle_message(Message::Bitfield(Bytes::from_static(&[0xff]))),
        Err(PeerError::Protocol("unexpected bitfield"))
    ));
}

#[test]
fn test_conflicting_fast_messages_fatal() {
    let mut session = test_session();
    session.handle_message(Message::HaveAll).unwrap();
    assert!(session.peer_has_piece(123));
    assert!(matches!(
        session.handle_message(Message::HaveNone),
        Err(PeerError::Protocol(_))
    ));

    let mut session = test_session();
    session.handle_message(Message::HaveNone).unwrap();
    assert!(matches!(
        session.handle_message(Message::HaveAll),
        Err(PeerError::Protocol(_))
    ));
}

#[test]
fn test_have_out_of_range_fatal_only_with_metadata() {
    let mut session = test_session();
    session.known_pieces = Some(4);
    session
        .handle_message(Message::Bitfield(Bytes::from_static(&[0x00])))
        .unwrap();
    assert!(session
        .handle_message(Message::Have { index: 9 })
        .is_err());

    // Without metadata the peer map grows as needed.
    let mut session = test_session();
    let events = session.handle_message(Message::Have { index: 9 }).unwrap();
    assert!(matches!(
        &events[..],
        [SessionEvent::PeerGainedPieces(gained)] if gained == &vec![9]
    ));
    assert!(session.peer_has_piece(9));
    assert!(!session.peer_has_piece(8));
}

#[test]
fn test_unrequested_chunk_flagged() {
    let mut session = test_session();
    session.requests.insert(Request::new(1, 0, 5));

    let events = session
        .handle_message(Message::Piece {
            index: 1,
            begin: 0,
            data: Bytes::from_static(b"hello"),
        })
        .unwrap();
    assert!(matches!(
        &events[..],
        [SessionEvent::ChunkReceived { was_requested: true, .. }]
    ));
    assert!(session.requests.is_empty());

    let events = session
        .handle_message(Message::Piece {
            index: 7,
            begin: 0,
            data: Bytes::from_static(b"stray"),
        })
        .unwrap();
    assert!(matches!(
        &events[..],
        [SessionEvent::ChunkReceived { was_requested: false, .. }]
    ));
}

#[test]
fn test_oversized_upload_request_fatal() {
    let mut session = test_session();
    assert!(session
        .handle_message(Message::Request {
            index: 0,
            begin: 0,
            length: 256 * 1024,
        })
        .is_err());
}

#[test]
fn test_extended_handshake_updates_state() {
    let mut session = test_session();
    let hs = ExtensionHandshake::ours("other/1.0", 500, Some(40_000), Some(6881), None);
    let events = session
        .handle_message(Message::Extended {
            id: extension::EXTENSION_HANDSHAKE_ID,
            payload: Bytes::from(hs.encode()),
        })
        .unwrap();

    assert_eq!(session.peer_max_requests, 500);
    assert_eq!(session.peer_client_name.as_deref(), Some("other/1.0"));
    assert_eq!(session.peer_ut_metadata_id(), Some(extension::UT_METADATA_ID));
    match &events[..] {
        [SessionEvent::ExtendedHandshake(got)] => {
            assert_eq!(got.metadata_size, Some(40_000));
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[test]
fn test_unknown_extended_id_fatal_unless_buggy_client() {
    let mut session = test_session();
    assert!(session
        .handle_message(Message::Extended {
            id: 99,
            payload: Bytes::new(),
        })
        .is_err());

    let mut buggy = test_session();
    let mut id = *b"-SD0100-____________";
    rand::Rng::fill(&mut rand::rng(), &mut id[8..]);
    buggy.peer_id = PeerId::from_bytes(id);
    let events = buggy
        .handle_message(Message::Extended {
            id: 99,
            payload: Bytes::new(),
        })
        .unwrap();
    assert!(events.is_empty());
}

#[test]
fn test_reject_request_triggers_replenish() {
    let mut session = test_session();
    session.requests.insert(Request::new(2, 0, 16384));
    let events = session
        .handle_message(Message::RejectRequest {
            index: 2,
            begin: 0,
            length: 16384,
        })
        .unwrap();
    assert!(matches!(&events[..], [SessionEvent::NeedReplenish]));
    assert!(session.requests.is_empty());

    // Rejecting something we never asked for is ignored.
    let events = session
        .handle_message(Message::RejectRequest {
            index: 2,
            begin: 0,
            length: 16384,
        })
        .unwrap();
    assert!(events.is_empty());
}

#[test]
fn test_apply_request_state_posts_deltas() {
    let mut session = test_session();
    let queue = session.queue().clone();

    let keep = Request::new(0, 0, 16384);
    let stale = Request::new(0, 16384, 16384);
    session.requests.insert(keep);
    session.requests.insert(stale);

    let fresh = Request::new(1, 0, 16384);
    let next = PeerRequestState {
        interested: true,
        requests: [keep, fresh].into_iter().collect(),
    };
    session.apply_request_state(&next);

    assert!(session.interested);
    assert_eq!(session.requests, next.requests);

    let queued = queue.queued();
    assert!(queued.contains(&Message::Interested));
    assert!(queued.contains(&Message::Cancel {
        index: 0,
        begin: 16384,
        length: 16384
    }));
    assert!(queued.contains(&Message::Request {
        index: 1,
        begin: 0,
        length: 16384
    }));
    // The kept request is not re-posted.
    assert!(!queued.contains(&Message::Request {
        index: 0,
        begin: 0,
        length: 16384
    }));
}

#[test]
fn test_apply_request_state_respects_ceiling() {
    let mut session = test_session();
    session.peer_max_requests = 2;
    let next = PeerRequestState {
        interested: true,
        requests: (0..8).map(|i| Request::new(0, i * 16384, 16384)).collect(),
    };
    session.apply_request_state(&next);
    assert_eq!(session.requests.len(), 2);
}

#[test]
fn test_metadata_message_codec() {
    let request = MetadataMessage::request(3);
    assert_eq!(
        MetadataMessage::decode(&request.encode()).unwrap(),
        request
    );

    let data = MetadataMessage::data(0, 27, Bytes::from_static(b"raw piece bytes follow here"));
    let decoded = MetadataMessage::decode(&data.encode()).unwrap();
    assert_eq!(decoded, data);
    assert_eq!(
        decoded.data.as_deref(),
        Some(b"raw piece bytes follow here".as_slice())
    );

    let reject = MetadataMessage::reject(1);
    assert_eq!(MetadataMessage::decode(&reject.encode()).unwrap(), reject);
}

#[test]
fn test_metadata_piece_math() {
    use super::metadata::{metadata_piece_count, metadata_piece_len};
    assert_eq!(metadata_piece_count(0), 0);
    assert_eq!(metadata_piece_count(16384), 1);
    assert_eq!(metadata_piece_count(16385), 2);
    assert_eq!(metadata_piece_len(0, 40_000), 16384);
    assert_eq!(metadata_piece_len(2, 40_000), 40_000 - 2 * 16384);
}

#[test]
fn test_peer_id_prefix_checks() {
    let id = PeerId::generate();
    assert!(!id.has_buggy_extension_ids());
    assert!(PeerId::from_bytes(*b"-SD0100-000000000000").has_buggy_extension_ids());
    assert!(PeerId::from_bytes(*b"-XL0012-000000000000").has_buggy_extension_ids());
}

#[test]
fn test_bitfield_wire_rules() {
    // Short bitfields are rejected, oversized are truncated.
    assert!(Bitfield::from_wire(&Bytes::from_static(&[0xff]), 9).is_none());
    let field = Bitfield::from_wire(&Bytes::from_static(&[0xff, 0xff]), 9).unwrap();
    assert_eq!(field.count(), 9);
    assert!(field.has(8));
    assert!(!field.has(9));
}
