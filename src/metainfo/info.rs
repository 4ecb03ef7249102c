use std::path::PathBuf;

use bytes::Bytes;

use super::error::MetainfoError;
use super::info_hash::InfoHash;
use crate::bencode::{from_bytes, to_bytes, Value};

/// A parsed `.torrent` file: the info dictionary plus tracker tiers and
/// optional provenance fields.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info: Info,
    pub info_hash: InfoHash,
    /// Tracker tiers (BEP-12). A bare `announce` key becomes a single
    /// one-element tier.
    pub announce_list: Vec<Vec<String>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
    raw_info: Bytes,
}

/// The piece layout of a torrent: name, piece length, per-piece SHA-1
/// hashes, and the file list.
#[derive(Debug, Clone)]
pub struct Info {
    pub name: String,
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub total_length: u64,
    pub private: bool,
}

/// One file within a torrent, with its byte offset into the piece space.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

impl Metainfo {
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let root = from_bytes(data)?;
        let dict = root.as_dict().ok_or(MetainfoError::InvalidField("root"))?;

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;
        let raw_info = Bytes::from(to_bytes(info_value));
        let info_hash = InfoHash::of_info_dict(&raw_info);
        let info = Info::from_value(info_value)?;

        let mut announce_list: Vec<Vec<String>> = dict
            .get(b"announce-list".as_slice())
            .and_then(Value::as_list)
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| {
                        tier.as_list().map(|urls| {
                            urls.iter()
                                .filter_map(|u| u.as_text().map(String::from))
                                .collect::<Vec<_>>()
                        })
                    })
                    .filter(|tier: &Vec<String>| !tier.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        if announce_list.is_empty() {
            if let Some(announce) = dict.get(b"announce".as_slice()).and_then(Value::as_text) {
                announce_list.push(vec![announce.to_string()]);
            }
        }

        Ok(Self {
            info,
            info_hash,
            announce_list,
            comment: dict
                .get(b"comment".as_slice())
                .and_then(Value::as_text)
                .map(String::from),
            created_by: dict
                .get(b"created by".as_slice())
                .and_then(Value::as_text)
                .map(String::from),
            creation_date: dict.get(b"creation date".as_slice()).and_then(Value::as_int),
            raw_info,
        })
    }

    /// The bencoded info dictionary, byte-for-byte as hashed. This is
    /// what ut_metadata serves to peers.
    pub fn raw_info(&self) -> &Bytes {
        &self.raw_info
    }

    /// Re-encodes the metainfo for the on-disk cache.
    pub fn to_bytes(&self) -> Vec<u8> {
        use std::collections::BTreeMap;
        let mut dict = BTreeMap::new();
        if let Some(first) = self.announce_list.first().and_then(|t| t.first()) {
            dict.insert(Bytes::from_static(b"announce"), Value::text(first));
        }
        if !self.announce_list.is_empty() {
            dict.insert(
                Bytes::from_static(b"announce-list"),
                Value::List(
                    self.announce_list
                        .iter()
                        .map(|tier| {
                            Value::List(tier.iter().map(|u| Value::text(u)).collect())
                        })
                        .collect(),
                ),
            );
        }
        // Decoding the raw bytes cannot fail: they were produced by our
        // own encoder or verified against the info hash on the way in.
        if let Ok(info) = from_bytes(&self.raw_info) {
            dict.insert(Bytes::from_static(b"info"), info);
        }
        to_bytes(&Value::Dict(dict))
    }
}

impl Info {
    /// Parses an info dictionary value, as found in a `.torrent` file or
    /// reassembled from ut_metadata pieces.
    pub fn from_value(value: &Value) -> Result<Self, MetainfoError> {
        let dict = value.as_dict().ok_or(MetainfoError::InvalidField("info"))?;

        let name = dict
            .get(b"name".as_slice())
            .and_then(Value::as_text)
            .ok_or(MetainfoError::MissingField("name"))?
            .to_string();

        let piece_length = dict
            .get(b"piece length".as_slice())
            .and_then(Value::as_int)
            .filter(|&l| l > 0)
            .ok_or(MetainfoError::MissingField("piece length"))?
            as u64;

        let pieces_raw = dict
            .get(b"pieces".as_slice())
            .and_then(Value::as_str_bytes)
            .ok_or(MetainfoError::MissingField("pieces"))?;
        if pieces_raw.len() % 20 != 0 {
            return Err(MetainfoError::BadPiecesLength);
        }
        let piece_hashes: Vec<[u8; 20]> = pieces_raw
            .chunks_exact(20)
            .map(|c| {
                let mut h = [0u8; 20];
                h.copy_from_slice(c);
                h
            })
            .collect();

        let private = dict
            .get(b"private".as_slice())
            .and_then(Value::as_int)
            .map(|v| v == 1)
            .unwrap_or(false);

        let mut files = Vec::new();
        let mut total_length = 0u64;
        match dict.get(b"files".as_slice()).and_then(Value::as_list) {
            Some(list) => {
                for entry in list {
                    let length = entry
                        .get(b"length")
                        .and_then(Value::as_int)
                        .filter(|&l| l >= 0)
                        .ok_or(MetainfoError::MissingField("length"))?
                        as u64;
                    let mut path = PathBuf::from(&name);
                    let components = entry
                        .get(b"path")
                        .and_then(Value::as_list)
                        .ok_or(MetainfoError::MissingField("path"))?;
                    for component in components {
                        let part = component
                            .as_text()
                            .ok_or(MetainfoError::InvalidField("path"))?;
                        // Reject traversal components from untrusted metadata.
                        if part == ".." || part.contains('/') || part.contains('\\') {
                            return Err(MetainfoError::InvalidField("path"));
                        }
                        path.push(part);
                    }
                    files.push(FileEntry {
                        path,
                        length,
                        offset: total_length,
                    });
                    total_length += length;
                }
            }
            None => {
                let length = dict
                    .get(b"length".as_slice())
                    .and_then(Value::as_int)
                    .filter(|&l| l >= 0)
                    .ok_or(MetainfoError::MissingField("length"))?
                    as u64;
                files.push(FileEntry {
                    path: PathBuf::from(&name),
                    length,
                    offset: 0,
                });
                total_length = length;
            }
        }

        let expected_pieces = total_length.div_ceil(piece_length) as usize;
        if piece_hashes.len() != expected_pieces {
            return Err(MetainfoError::BadPiecesLength);
        }

        Ok(Self {
            name,
            piece_length,
            piece_hashes,
            files,
            total_length,
            private,
        })
    }

    /// Parses a raw bencoded info dictionary, as reassembled from
    /// ut_metadata pieces.
    pub fn from_dict_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        Self::from_value(&from_bytes(data)?)
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of a specific piece. Only the final piece may be short.
    pub fn piece_len(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        (self.total_length - start.min(self.total_length)).min(self.piece_length)
    }
}
