//! `.torrent` metadata parsing and info hash calculation.

use std::path::Path;

use sha1::{Digest, Sha1};

use super::{InfoHash, TorrentError};

type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;

/// Complete metadata extracted from a `.torrent` file.
///
/// Everything the engine needs to build its path index and drive the
/// session: piece geometry, file layout, and tracker URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    /// Metadata-provided torrent name (`info.name`).
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub files: Vec<TorrentFile>,
    pub announce_urls: Vec<String>,
}

impl TorrentMetadata {
    /// Number of pieces in the torrent.
    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }
}

/// Individual file within a torrent: relative path components and length.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
}

/// Parser for `.torrent` files with a configurable metadata size cap.
///
/// Oversized metadata is rejected before any bencode work happens so a
/// hostile watch directory cannot balloon daemon memory.
pub struct MetadataParser {
    max_metadata_bytes: u64,
}

impl MetadataParser {
    /// Creates a parser enforcing the given metadata size cap.
    pub fn new(max_metadata_bytes: u64) -> Self {
        Self { max_metadata_bytes }
    }

    /// Reads and parses a `.torrent` file from disk.
    ///
    /// # Errors
    /// - `TorrentError::MetadataTooLarge` - file exceeds the configured cap
    /// - `TorrentError::InvalidTorrentFile` - malformed bencode or missing fields
    pub async fn parse_file(&self, path: &Path) -> Result<TorrentMetadata, TorrentError> {
        let meta = tokio::fs::metadata(path).await?;
        if meta.len() > self.max_metadata_bytes {
            return Err(TorrentError::MetadataTooLarge {
                limit: self.max_metadata_bytes,
            });
        }
        let bytes = tokio::fs::read(path).await?;
        self.parse_bytes(&bytes)
    }

    /// Parses raw `.torrent` bytes.
    ///
    /// # Errors
    /// - `TorrentError::MetadataTooLarge` - data exceeds the configured cap
    /// - `TorrentError::InvalidTorrentFile` - malformed bencode or missing fields
    pub fn parse_bytes(&self, torrent_bytes: &[u8]) -> Result<TorrentMetadata, TorrentError> {
        if torrent_bytes.len() as u64 > self.max_metadata_bytes {
            return Err(TorrentError::MetadataTooLarge {
                limit: self.max_metadata_bytes,
            });
        }

        let parsed = bencode_rs::Value::parse(torrent_bytes).map_err(|e| {
            TorrentError::InvalidTorrentFile {
                reason: format!("bencode parsing failed: {e:?}"),
            }
        })?;

        let root = parsed.first().ok_or_else(|| TorrentError::InvalidTorrentFile {
            reason: "empty bencode data".to_string(),
        })?;
        let bencode_rs::Value::Dictionary(dict) = root else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "root element must be a dictionary".to_string(),
            });
        };

        extract_metadata(dict, torrent_bytes)
    }
}

fn extract_metadata(
    dict: &BencodeDict<'_>,
    original_data: &[u8],
) -> Result<TorrentMetadata, TorrentError> {
    let info_value =
        dict.get(b"info".as_slice())
            .ok_or_else(|| TorrentError::InvalidTorrentFile {
                reason: "missing 'info' field".to_string(),
            })?;

    let info_hash = calculate_info_hash(original_data)?;

    let bencode_rs::Value::Dictionary(info) = info_value else {
        return Err(TorrentError::InvalidTorrentFile {
            reason: "'info' field must be a dictionary".to_string(),
        });
    };

    let name = extract_string(info, b"name")?;
    let piece_length = extract_integer(info, b"piece length")? as u32;
    if piece_length == 0 {
        return Err(TorrentError::InvalidTorrentFile {
            reason: "piece length must be positive".to_string(),
        });
    }

    let pieces_bytes = extract_bytes(info, b"pieces")?;
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidTorrentFile {
            reason: "pieces field is not a multiple of 20 bytes".to_string(),
        });
    }
    let piece_hashes: Vec<[u8; 20]> = pieces_bytes
        .chunks(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    let (files, total_length) = if let Ok(length) = extract_integer(info, b"length") {
        // Single-file torrent: the name doubles as the file path.
        let files = vec![TorrentFile {
            path: vec![name.clone()],
            length: length as u64,
        }];
        (files, length as u64)
    } else if let Some(bencode_rs::Value::List(files_list)) = info.get(b"files".as_slice()) {
        extract_files(files_list)?
    } else {
        return Err(TorrentError::InvalidTorrentFile {
            reason: "missing 'files' or 'length' field".to_string(),
        });
    };

    // Trackerless torrents are fine; torrentfs can add aliases or rely on DHT.
    let announce_urls = extract_announce_urls(dict);

    Ok(TorrentMetadata {
        info_hash,
        name,
        piece_length,
        piece_hashes,
        total_length,
        files,
        announce_urls,
    })
}

/// SHA-1 of the raw info dictionary bytes within the original data.
fn calculate_info_hash(original_data: &[u8]) -> Result<InfoHash, TorrentError> {
    let info_start = original_data
        .windows(b"4:info".len())
        .position(|window| window == b"4:info")
        .ok_or_else(|| TorrentError::InvalidTorrentFile {
            reason: "could not find info dictionary".to_string(),
        })?;
    let info_data_start = info_start + b"4:info".len();

    let info_dict_data = &original_data[info_data_start..];
    let info_dict_end = find_dictionary_end(info_dict_data)?;
    let info_dict_bytes = &original_data[info_data_start..info_data_start + info_dict_end];

    let mut hasher = Sha1::new();
    hasher.update(info_dict_bytes);
    let digest = hasher.finalize();
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    Ok(InfoHash::new(hash))
}

/// Finds the end position of a bencode dictionary starting at `data[0]`.
fn find_dictionary_end(data: &[u8]) -> Result<usize, TorrentError> {
    if data.first() != Some(&b'd') {
        return Err(TorrentError::InvalidTorrentFile {
            reason: "expected dictionary start".to_string(),
        });
    }

    let mut pos = 1;
    let mut depth = 1;

    while pos < data.len() && depth > 0 {
        match data[pos] {
            b'd' | b'l' => {
                depth += 1;
                pos += 1;
            }
            b'e' => {
                depth -= 1;
                pos += 1;
            }
            b'i' => {
                pos += 1;
                while pos < data.len() && data[pos] != b'e' {
                    pos += 1;
                }
                pos += 1;
            }
            b'0'..=b'9' => {
                let start = pos;
                while pos < data.len() && data[pos] != b':' {
                    pos += 1;
                }
                if pos >= data.len() {
                    return Err(TorrentError::InvalidTorrentFile {
                        reason: "truncated string length".to_string(),
                    });
                }
                let length: usize = std::str::from_utf8(&data[start..pos])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| TorrentError::InvalidTorrentFile {
                        reason: "invalid string length".to_string(),
                    })?;
                pos += 1 + length;
            }
            _ => {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "invalid bencode character".to_string(),
                });
            }
        }
    }

    if depth != 0 {
        return Err(TorrentError::InvalidTorrentFile {
            reason: "incomplete bencode dictionary".to_string(),
        });
    }
    Ok(pos)
}

fn extract_string(dict: &BencodeDict<'_>, key: &[u8]) -> Result<String, TorrentError> {
    let bytes = extract_bytes(dict, key)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| TorrentError::InvalidTorrentFile {
        reason: format!("invalid UTF-8 in field {:?}", String::from_utf8_lossy(key)),
    })
}

fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> Result<&'a [u8], TorrentError> {
    match dict.get(key) {
        Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
        _ => Err(TorrentError::InvalidTorrentFile {
            reason: format!(
                "missing or invalid field {:?}",
                String::from_utf8_lossy(key)
            ),
        }),
    }
}

fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> Result<i64, TorrentError> {
    match dict.get(key) {
        Some(bencode_rs::Value::Integer(value)) => Ok(*value),
        _ => Err(TorrentError::InvalidTorrentFile {
            reason: format!(
                "missing or invalid integer field {:?}",
                String::from_utf8_lossy(key)
            ),
        }),
    }
}

fn extract_files(
    files_list: &[bencode_rs::Value<'_>],
) -> Result<(Vec<TorrentFile>, u64), TorrentError> {
    let mut files = Vec::new();
    let mut total_length = 0u64;

    for file_value in files_list {
        let bencode_rs::Value::Dictionary(file_dict) = file_value else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "invalid file entry type".to_string(),
            });
        };

        let length = extract_integer(file_dict, b"length")? as u64;
        total_length += length;

        let path_list = match file_dict.get(b"path".as_slice()) {
            Some(bencode_rs::Value::List(path_list)) => path_list,
            _ => {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "missing or invalid path in file entry".to_string(),
                });
            }
        };

        let mut path = Vec::new();
        for component in path_list {
            let bencode_rs::Value::Bytes(bytes) = component else {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "invalid path component type".to_string(),
                });
            };
            let component = String::from_utf8(bytes.to_vec()).map_err(|_| {
                TorrentError::InvalidTorrentFile {
                    reason: "invalid UTF-8 in file path".to_string(),
                }
            })?;
            path.push(component);
        }

        files.push(TorrentFile { path, length });
    }

    Ok((files, total_length))
}

fn extract_announce_urls(dict: &BencodeDict<'_>) -> Vec<String> {
    let mut announce_urls = Vec::new();

    if let Ok(announce) = extract_string(dict, b"announce") {
        announce_urls.push(announce);
    }

    if let Some(bencode_rs::Value::List(announce_list)) = dict.get(b"announce-list".as_slice()) {
        for tier in announce_list {
            if let bencode_rs::Value::List(tier_urls) = tier {
                for url_value in tier_urls {
                    if let bencode_rs::Value::Bytes(url_bytes) = url_value
                        && let Ok(url) = String::from_utf8(url_bytes.to_vec())
                        && !announce_urls.contains(&url)
                    {
                        announce_urls.push(url);
                    }
                }
            }
        }
    }

    announce_urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentBuilder;

    #[test]
    fn parses_multi_file_torrent() {
        let built = TorrentBuilder::new("album", 16)
            .file("disc1/track01.mp3", b"0123456789abcdef0123".to_vec())
            .file("cover.jpg", b"jpegdata".to_vec())
            .announce("http://tracker.example/announce")
            .build();

        let parser = MetadataParser::new(1024 * 1024);
        let meta = parser.parse_bytes(&built.torrent_bytes).unwrap();

        assert_eq!(meta.name, "album");
        assert_eq!(meta.piece_length, 16);
        assert_eq!(meta.total_length, 28);
        assert_eq!(meta.files.len(), 2);
        assert_eq!(meta.files[0].path, vec!["disc1", "track01.mp3"]);
        assert_eq!(meta.num_pieces(), 2);
        assert_eq!(
            meta.announce_urls,
            vec!["http://tracker.example/announce".to_string()]
        );
        assert_eq!(meta.info_hash, built.metadata.info_hash);
    }

    #[test]
    fn parses_single_file_torrent() {
        let built = TorrentBuilder::new("notes.txt", 32)
            .single_file(b"hello torrentfs".to_vec())
            .build();

        let parser = MetadataParser::new(1024 * 1024);
        let meta = parser.parse_bytes(&built.torrent_bytes).unwrap();

        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.files[0].path, vec!["notes.txt"]);
        assert_eq!(meta.total_length, 15);
    }

    #[test]
    fn rejects_oversized_metadata() {
        let parser = MetadataParser::new(8);
        let err = parser.parse_bytes(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, TorrentError::MetadataTooLarge { .. }));
    }

    #[test]
    fn rejects_garbage() {
        let parser = MetadataParser::new(1024);
        assert!(parser.parse_bytes(b"not bencode at all").is_err());
    }
}
