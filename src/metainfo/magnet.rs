use super::error::MetainfoError;
use super::info_hash::InfoHash;

/// A parsed magnet URI (BEP-9): `magnet:?xt=urn:btih:<hash>&dn=..&tr=..`.
///
/// A magnet carries the info hash only; the info dictionary itself is
/// fetched from peers via ut_metadata.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    /// Tracker URLs, one tier each per BEP-12 convention for magnets.
    pub trackers: Vec<String>,
}

impl MagnetLink {
    pub fn parse(uri: &str) -> Result<Self, MetainfoError> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| MetainfoError::BadMagnetLink("missing magnet:? prefix".into()))?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for pair in query.split('&') {
            let (key, raw) = match pair.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            match key {
                "xt" => {
                    let value = percent_decode(raw);
                    let hash = value.strip_prefix("urn:btih:").ok_or_else(|| {
                        MetainfoError::BadMagnetLink("unsupported xt format".into())
                    })?;
                    info_hash = Some(match hash.len() {
                        40 => InfoHash::from_hex(hash)?,
                        32 => {
                            let bytes = base32_decode(hash).ok_or_else(|| {
                                MetainfoError::BadMagnetLink("invalid base32".into())
                            })?;
                            InfoHash::from_bytes(&bytes)?
                        }
                        _ => {
                            return Err(MetainfoError::BadMagnetLink(
                                "invalid info hash length".into(),
                            ))
                        }
                    });
                }
                "dn" => display_name = Some(percent_decode(raw)),
                "tr" => trackers.push(percent_decode(raw)),
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash
                .ok_or_else(|| MetainfoError::BadMagnetLink("missing xt parameter".into()))?,
            display_name,
            trackers,
        })
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = &s[i + 1..i + 3];
                match u8::from_str_radix(hex, 16) {
                    Ok(b) => {
                        out.push(b);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn base32_decode(s: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits = 0u64;
    let mut bit_count = 0;
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    for c in s.bytes() {
        let v = ALPHABET.iter().position(|&a| a == c.to_ascii_uppercase())? as u64;
        bits = (bits << 5) | v;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }
    Some(out)
}
