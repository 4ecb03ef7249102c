use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{from_bytes, to_bytes, Value};

/// Sub-id zero of the extended message space is the extension
/// handshake itself.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// The local extended-message ids this client assigns in its `m` dict.
pub const UT_METADATA_ID: u8 = 1;
pub const UT_PEX_ID: u8 = 2;

/// The BEP-10 extension handshake dictionary, both directions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionHandshake {
    /// Extension name to the id the sender wants it addressed by.
    pub extensions: BTreeMap<String, u8>,
    /// The sender's client name and version (`v`).
    pub client: Option<String>,
    /// How many outstanding requests the sender accepts (`reqq`).
    pub reqq: Option<i64>,
    /// Size of the info dict in bytes, when the sender knows it.
    pub metadata_size: Option<i64>,
    /// The sender's listen port (`p`).
    pub port: Option<u16>,
    /// How the sender sees our IP, compact 4 or 16 bytes (`yourip`).
    pub your_ip: Option<Vec<u8>>,
}

impl ExtensionHandshake {
    /// The handshake we send: ut_metadata and ut_pex under our fixed
    /// local ids.
    pub fn ours(
        client: &str,
        reqq: i64,
        metadata_size: Option<i64>,
        port: Option<u16>,
        your_ip: Option<Vec<u8>>,
    ) -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert("ut_metadata".to_string(), UT_METADATA_ID);
        extensions.insert("ut_pex".to_string(), UT_PEX_ID);
        Self {
            extensions,
            client: Some(client.to_string()),
            reqq: Some(reqq),
            metadata_size,
            port,
            your_ip,
        }
    }

    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.extensions.get("ut_metadata").copied()
    }

    pub fn ut_pex_id(&self) -> Option<u8> {
        self.extensions.get("ut_pex").copied()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut m = BTreeMap::new();
        for (name, id) in &self.extensions {
            m.insert(
                Bytes::copy_from_slice(name.as_bytes()),
                Value::Int(*id as i64),
            );
        }
        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));
        if let Some(client) = &self.client {
            dict.insert(Bytes::from_static(b"v"), Value::text(client));
        }
        if let Some(reqq) = self.reqq {
            dict.insert(Bytes::from_static(b"reqq"), Value::Int(reqq));
        }
        if let Some(size) = self.metadata_size {
            dict.insert(Bytes::from_static(b"metadata_size"), Value::Int(size));
        }
        if let Some(port) = self.port {
            dict.insert(Bytes::from_static(b"p"), Value::Int(port as i64));
        }
        if let Some(ip) = &self.your_ip {
            dict.insert(
                Bytes::from_static(b"yourip"),
                Value::Str(Bytes::copy_from_slice(ip)),
            );
        }
        to_bytes(&Value::Dict(dict))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let root = from_bytes(payload)?;
        let dict = root
            .as_dict()
            .ok_or_else(|| PeerError::Extension("handshake is not a dict".into()))?;

        let mut hs = Self::default();
        if let Some(m) = dict.get(b"m".as_slice()).and_then(Value::as_dict) {
            for (name, id) in m {
                let (Ok(name), Some(id)) = (std::str::from_utf8(name), id.as_int()) else {
                    continue;
                };
                // Id zero retracts a previously advertised extension.
                if (1..=255).contains(&id) {
                    hs.extensions.insert(name.to_string(), id as u8);
                }
            }
        }
        hs.client = dict
            .get(b"v".as_slice())
            .and_then(Value::as_text)
            .map(String::from);
        hs.reqq = dict.get(b"reqq".as_slice()).and_then(Value::as_int);
        hs.metadata_size = dict.get(b"metadata_size".as_slice()).and_then(Value::as_int);
        hs.port = dict
            .get(b"p".as_slice())
            .and_then(Value::as_int)
            .and_then(|p| u16::try_from(p).ok());
        hs.your_ip = dict
            .get(b"yourip".as_slice())
            .and_then(Value::as_str_bytes)
            .map(|b| b.to_vec());
        Ok(hs)
    }
}
