//! In-process `.torrent` construction.
//!
//! Builds valid metainfo bytes plus the matching content blob. The sim
//! session and the test suites use this to fabricate deterministic swarms
//! without touching the network.

use sha1::{Digest, Sha1};

use super::{InfoHash, TorrentFile, TorrentMetadata};

/// A constructed torrent: metainfo bytes, parsed metadata, and the
/// concatenated content the pieces hash over.
#[derive(Debug, Clone)]
pub struct BuiltTorrent {
    pub metadata: TorrentMetadata,
    pub torrent_bytes: Vec<u8>,
    pub content: Vec<u8>,
}

/// Builder assembling a multi- or single-file torrent from in-memory data.
pub struct TorrentBuilder {
    name: String,
    piece_length: u32,
    announce_urls: Vec<String>,
    files: Vec<(String, Vec<u8>)>,
    single: bool,
}

impl TorrentBuilder {
    /// Starts a torrent named `name` with the given piece length.
    pub fn new(name: &str, piece_length: u32) -> Self {
        Self {
            name: name.to_string(),
            piece_length,
            announce_urls: Vec::new(),
            files: Vec::new(),
            single: false,
        }
    }

    /// Adds a file with `/`-separated relative `path` and its content.
    pub fn file(mut self, path: &str, content: Vec<u8>) -> Self {
        self.files.push((path.to_string(), content));
        self
    }

    /// Makes this a single-file torrent whose path is the torrent name.
    pub fn single_file(mut self, content: Vec<u8>) -> Self {
        self.single = true;
        self.files = vec![(self.name.clone(), content)];
        self
    }

    /// Adds a tracker announce URL.
    pub fn announce(mut self, url: &str) -> Self {
        self.announce_urls.push(url.to_string());
        self
    }

    /// Emits metainfo bytes, metadata, and the content blob.
    pub fn build(self) -> BuiltTorrent {
        let content: Vec<u8> = self
            .files
            .iter()
            .flat_map(|(_, data)| data.iter().copied())
            .collect();

        let piece_hashes: Vec<[u8; 20]> = content
            .chunks(self.piece_length.max(1) as usize)
            .map(|chunk| {
                let mut hasher = Sha1::new();
                hasher.update(chunk);
                let digest = hasher.finalize();
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&digest);
                hash
            })
            .collect();

        let info_bytes = self.encode_info(&piece_hashes);

        let mut hasher = Sha1::new();
        hasher.update(&info_bytes);
        let digest = hasher.finalize();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        let info_hash = InfoHash::new(hash);

        let mut torrent_bytes = Vec::new();
        torrent_bytes.push(b'd');
        if let Some(primary) = self.announce_urls.first() {
            encode_str(&mut torrent_bytes, "announce");
            encode_str(&mut torrent_bytes, primary);
        }
        encode_str(&mut torrent_bytes, "info");
        torrent_bytes.extend_from_slice(&info_bytes);
        torrent_bytes.push(b'e');

        let files = self
            .files
            .iter()
            .map(|(path, data)| TorrentFile {
                path: path.split('/').map(str::to_string).collect(),
                length: data.len() as u64,
            })
            .collect::<Vec<_>>();
        let total_length = files.iter().map(|f| f.length).sum();

        let metadata = TorrentMetadata {
            info_hash,
            name: self.name,
            piece_length: self.piece_length,
            piece_hashes,
            total_length,
            files,
            announce_urls: self.announce_urls,
        };

        BuiltTorrent {
            metadata,
            torrent_bytes,
            content,
        }
    }

    // Bencode dictionaries require keys in lexicographic byte order:
    // files < length < name < piece length < pieces.
    fn encode_info(&self, piece_hashes: &[[u8; 20]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(b'd');

        if self.single {
            let (_, data) = &self.files[0];
            encode_str(&mut out, "length");
            encode_int(&mut out, data.len() as i64);
        } else {
            encode_str(&mut out, "files");
            out.push(b'l');
            for (path, data) in &self.files {
                out.push(b'd');
                encode_str(&mut out, "length");
                encode_int(&mut out, data.len() as i64);
                encode_str(&mut out, "path");
                out.push(b'l');
                for component in path.split('/') {
                    encode_str(&mut out, component);
                }
                out.push(b'e');
                out.push(b'e');
            }
            out.push(b'e');
        }

        encode_str(&mut out, "name");
        encode_str(&mut out, &self.name);
        encode_str(&mut out, "piece length");
        encode_int(&mut out, self.piece_length as i64);

        let mut pieces = Vec::with_capacity(piece_hashes.len() * 20);
        for hash in piece_hashes {
            pieces.extend_from_slice(hash);
        }
        encode_str(&mut out, "pieces");
        encode_bytes(&mut out, &pieces);

        out.push(b'e');
        out
    }
}

fn encode_str(out: &mut Vec<u8>, s: &str) {
    encode_bytes(out, s.as_bytes());
}

fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

fn encode_int(out: &mut Vec<u8>, value: i64) {
    out.push(b'i');
    out.extend_from_slice(value.to_string().as_bytes());
    out.push(b'e');
}
