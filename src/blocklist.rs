//! IPv4 range blocklist with binary-search lookup and a packed on-disk
//! form for fast loading.
//!
//! The packed format is an 8-byte little-endian range count, then 20
//! bytes per range (4 bytes first address, 4 bytes last address, 8
//! bytes description offset, 4 bytes description length), then the
//! concatenated descriptions. Duplicate descriptions are stored once.
//!
//! Lists only ever contain IPv4 ranges; while a list is installed,
//! non-IPv4 peers are refused outright rather than guessed about.

use std::io::{BufRead, Write};
use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;

const PACKED_HEADER_LEN: usize = 8;
const PACKED_RANGE_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum BlocklistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated packed blocklist")]
    Truncated,

    #[error("bad blocklist line {0}: {1}")]
    BadLine(usize, String),
}

/// One blocked address range, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRange {
    pub first: Ipv4Addr,
    pub last: Ipv4Addr,
    pub description: String,
}

/// Why an address was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// Hit a listed range.
    Listed(String),
    /// Not an IPv4 address while an IPv4-only list is in force.
    NotIpv4,
}

/// A sorted set of blocked IPv4 ranges.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    ranges: Vec<IpRange>,
}

impl Blocklist {
    pub fn new(mut ranges: Vec<IpRange>) -> Self {
        ranges.sort_by_key(|r| r.first);
        Self { ranges }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }

    /// Looks up an IPv4 address. `O(log n)`.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<&IpRange> {
        let idx = self.ranges.partition_point(|r| r.last < ip);
        self.ranges
            .get(idx)
            .filter(|r| r.first <= ip && ip <= r.last)
    }

    /// Applies the list's policy to any address.
    pub fn block_reason(&self, ip: IpAddr) -> Option<BlockReason> {
        match ip {
            IpAddr::V4(v4) => self
                .lookup(v4)
                .map(|r| BlockReason::Listed(r.description.clone())),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => self
                    .lookup(v4)
                    .map(|r| BlockReason::Listed(r.description.clone())),
                None => Some(BlockReason::NotIpv4),
            },
        }
    }

    /// Parses the P2P plaintext format: `description:first-last` lines,
    /// `#` comments, blank lines ignored.
    pub fn parse_p2p(reader: impl BufRead) -> Result<Self, BlocklistError> {
        let mut ranges = Vec::new();
        for (num, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // The description itself may contain colons; the range is
            // everything after the last one.
            let (description, span) = line
                .rsplit_once(':')
                .ok_or_else(|| BlocklistError::BadLine(num + 1, line.to_string()))?;
            let (first, last) = span
                .split_once('-')
                .ok_or_else(|| BlocklistError::BadLine(num + 1, line.to_string()))?;
            let first: Ipv4Addr = first
                .trim()
                .parse()
                .map_err(|_| BlocklistError::BadLine(num + 1, line.to_string()))?;
            let last: Ipv4Addr = last
                .trim()
                .parse()
                .map_err(|_| BlocklistError::BadLine(num + 1, line.to_string()))?;
            ranges.push(IpRange {
                first,
                last,
                description: description.trim().to_string(),
            });
        }
        Ok(Self::new(ranges))
    }

    /// Writes the packed form.
    pub fn write_packed(&self, w: &mut impl Write) -> Result<(), BlocklistError> {
        use std::collections::HashMap;

        let mut desc_offsets: HashMap<&str, u64> = HashMap::new();
        let mut descs: Vec<&str> = Vec::new();
        let mut next_offset = 0u64;

        w.write_all(&(self.ranges.len() as u64).to_le_bytes())?;
        for range in &self.ranges {
            w.write_all(&range.first.octets())?;
            w.write_all(&range.last.octets())?;
            let offset = match desc_offsets.get(range.description.as_str()) {
                Some(&off) => off,
                None => {
                    let off = next_offset;
                    desc_offsets.insert(&range.description, off);
                    descs.push(&range.description);
                    next_offset += range.description.len() as u64;
                    off
                }
            };
            w.write_all(&offset.to_le_bytes())?;
            w.write_all(&(range.description.len() as u32).to_le_bytes())?;
        }
        for desc in descs {
            w.write_all(desc.as_bytes())?;
        }
        Ok(())
    }

    /// Parses the packed form.
    pub fn from_packed(data: &[u8]) -> Result<Self, BlocklistError> {
        if data.len() < PACKED_HEADER_LEN {
            return Err(BlocklistError::Truncated);
        }
        let count = u64::from_le_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]) as usize;
        let descs_base = PACKED_HEADER_LEN + PACKED_RANGE_LEN * count;
        if data.len() < descs_base {
            return Err(BlocklistError::Truncated);
        }

        let mut ranges = Vec::with_capacity(count);
        for i in 0..count {
            let at = PACKED_HEADER_LEN + PACKED_RANGE_LEN * i;
            let first = Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3]);
            let last = Ipv4Addr::new(data[at + 4], data[at + 5], data[at + 6], data[at + 7]);
            let desc_off = u64::from_le_bytes([
                data[at + 8],
                data[at + 9],
                data[at + 10],
                data[at + 11],
                data[at + 12],
                data[at + 13],
                data[at + 14],
                data[at + 15],
            ]) as usize;
            let desc_len = u32::from_le_bytes([
                data[at + 16],
                data[at + 17],
                data[at + 18],
                data[at + 19],
            ]) as usize;
            let start = descs_base + desc_off;
            let end = start.checked_add(desc_len).ok_or(BlocklistError::Truncated)?;
            if end > data.len() {
                return Err(BlocklistError::Truncated);
            }
            ranges.push(IpRange {
                first,
                last,
                description: String::from_utf8_lossy(&data[start..end]).into_owned(),
            });
        }
        Ok(Self::new(ranges))
    }
}
