//! Torrent identity and metadata primitives.

pub mod creation;
pub mod magnet;
pub mod metadata;

use std::fmt;

pub use creation::TorrentBuilder;
pub use magnet::MagnetParser;
pub use metadata::{MetadataParser, TorrentFile, TorrentMetadata};

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Stable torrent identifier: infohash-derived lowercase hex.
///
/// Used on the wire, in cache directory names, and as the registry key.
/// The `short` form (first 12 hex chars) disambiguates colliding torrent
/// names as `name__<short-id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TorrentId(String);

/// Length of the short id used for name disambiguation.
pub const SHORT_ID_LEN: usize = 12;

impl TorrentId {
    /// Returns the full 40-char hex id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first [`SHORT_ID_LEN`] hex chars.
    pub fn short(&self) -> &str {
        &self.0[..SHORT_ID_LEN.min(self.0.len())]
    }

    /// Parses an id token received over RPC. Accepts any non-empty
    /// lowercase-hex string so lookups against the registry stay exact.
    pub fn from_token(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl From<InfoHash> for TorrentId {
    fn from(hash: InfoHash) -> Self {
        Self(hash.to_string())
    }
}

impl fmt::Display for TorrentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised while loading torrent metadata.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Invalid magnet link: {reason}")]
    InvalidMagnetLink { reason: String },

    #[error("Torrent metadata exceeds {limit} bytes")]
    MetadataTooLarge { limit: u64 },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_hash_displays_as_hex() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn torrent_id_short_form() {
        let id = TorrentId::from(InfoHash::new([0xab; 20]));
        assert_eq!(id.as_str().len(), 40);
        assert_eq!(id.short(), "abababababab");
    }

    #[test]
    fn piece_index_ordering() {
        assert!(PieceIndex::new(5) < PieceIndex::new(10));
    }
}
