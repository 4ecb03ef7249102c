use std::fmt;

use rand::Rng as _;

use crate::constants::PEER_ID_PREFIX;

/// A 20-byte peer identity (Azureus style: `-SH0001-` then random).
///
/// Used for duplicate suppression and self-dial detection; two
/// connections with the same id are the same client instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
        rand::rng().fill(&mut id[PEER_ID_PREFIX.len()..]);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// True for client-id prefixes with known protocol bugs that the
    /// session tolerates instead of erroring on.
    pub fn has_buggy_extension_ids(&self) -> bool {
        self.0.starts_with(b"-SD0100-") || self.0.starts_with(b"-XL0012-")
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId(")?;
        for b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", *b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        write!(f, ")")
    }
}
