//! Magnet link parsing.

use super::{InfoHash, TorrentError};

/// Parsed magnet URI: info hash plus optional display name and trackers.
#[derive(Debug, Clone, PartialEq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

/// Magnet link parsing utilities.
pub struct MagnetParser;

impl MagnetParser {
    /// Parses a magnet link and extracts the v1 (btih) info hash.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMagnetLink` - malformed URI or missing btih hash
    pub fn parse(magnet_uri: &str) -> Result<MagnetLink, TorrentError> {
        let magnet =
            magnet_url::Magnet::new(magnet_uri).map_err(|e| TorrentError::InvalidMagnetLink {
                reason: format!("{e:?}"),
            })?;

        let info_hash = Self::extract_info_hash(magnet_uri)?;

        Ok(MagnetLink {
            info_hash,
            display_name: magnet.dn,
            trackers: magnet.tr,
        })
    }

    /// Pulls the `xt=urn:btih:<hex>` parameter out of the raw URI.
    fn extract_info_hash(magnet_uri: &str) -> Result<InfoHash, TorrentError> {
        for part in magnet_uri.split(['?', '&']) {
            if let Some(hash_str) = part.strip_prefix("xt=urn:btih:") {
                return Self::parse_hex_hash(hash_str);
            }
        }
        Err(TorrentError::InvalidMagnetLink {
            reason: "missing urn:btih info hash".to_string(),
        })
    }

    fn parse_hex_hash(hash_str: &str) -> Result<InfoHash, TorrentError> {
        if hash_str.len() != 40 || !hash_str.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TorrentError::InvalidMagnetLink {
                reason: format!("expected 40 hex chars, got {:?}", hash_str),
            });
        }
        let mut hash = [0u8; 20];
        for (i, byte) in hash.iter_mut().enumerate() {
            let pair = &hash_str[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|_| TorrentError::InvalidMagnetLink {
                reason: format!("invalid hex pair {pair:?}"),
            })?;
        }
        Ok(InfoHash::new(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hash_and_display_name() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=test";
        let link = MagnetParser::parse(uri).unwrap();
        assert_eq!(
            link.info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn rejects_missing_hash() {
        assert!(MagnetParser::parse("magnet:?dn=test").is_err());
    }

    #[test]
    fn rejects_short_hash() {
        assert!(MagnetParser::parse("magnet:?xt=urn:btih:abcd").is_err());
    }
}
