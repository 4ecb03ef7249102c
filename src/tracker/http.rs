use std::fmt::Write as _;

use crate::bencode::{from_bytes, Value};

use super::error::TrackerError;
use super::response::{parse_compact_peers, parse_compact_peers6, AnnounceResponse};
use super::AnnounceRequest;

/// Announces over HTTP(S): a GET with the BEP-3 query parameters,
/// expecting a bencoded dict back. `compact=1` is always requested;
/// both the compact and the dictionary peer forms are accepted.
pub async fn announce(
    url: &str,
    request: &AnnounceRequest,
) -> Result<AnnounceResponse, TrackerError> {
    let url = build_url(url, request);

    let client = reqwest::Client::builder().build()?;
    let body = client.get(&url).send().await?.bytes().await?;

    parse_response(&body)
}

pub(super) fn build_url(base: &str, request: &AnnounceRequest) -> String {
    let mut url = String::with_capacity(base.len() + 160);
    url.push_str(base);
    url.push(if base.contains('?') { '&' } else { '?' });
    let _ = write!(
        url,
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        request.info_hash.url_encode(),
        url_encode_bytes(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
    );
    if let Some(num_want) = request.num_want {
        let _ = write!(url, "&numwant={}", num_want);
    }
    let event = request.event.query_value();
    if !event.is_empty() {
        let _ = write!(url, "&event={}", event);
    }
    url
}

pub(super) fn parse_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let root = from_bytes(body)?;
    let dict = root
        .as_dict()
        .ok_or_else(|| TrackerError::BadResponse("expected dict".into()))?;

    if let Some(reason) = dict.get(b"failure reason".as_slice()).and_then(Value::as_text) {
        return Err(TrackerError::Failure(reason.to_string()));
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(Value::as_int)
        .ok_or_else(|| TrackerError::BadResponse("missing interval".into()))? as u32;

    let mut response = AnnounceResponse::new(interval);
    response.min_interval = dict
        .get(b"min interval".as_slice())
        .and_then(Value::as_int)
        .map(|v| v as u32);
    response.complete = dict
        .get(b"complete".as_slice())
        .and_then(Value::as_int)
        .map(|v| v as u32);
    response.incomplete = dict
        .get(b"incomplete".as_slice())
        .and_then(Value::as_int)
        .map(|v| v as u32);

    match dict.get(b"peers".as_slice()) {
        Some(Value::Str(compact)) => {
            response.peers = parse_compact_peers(compact);
        }
        Some(Value::List(list)) => {
            for peer in list {
                let ip = peer
                    .get(b"ip")
                    .and_then(Value::as_text)
                    .and_then(|s| s.parse().ok());
                let port = peer.get(b"port").and_then(Value::as_int).map(|p| p as u16);
                if let (Some(ip), Some(port)) = (ip, port) {
                    response.peers.push(std::net::SocketAddr::new(ip, port));
                }
            }
        }
        _ => {}
    }

    if let Some(compact6) = dict.get(b"peers6".as_slice()).and_then(Value::as_str_bytes) {
        response.peers.extend(parse_compact_peers6(compact6));
    }

    Ok(response)
}

fn url_encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{:02x}", b);
        }
    }
    out
}
