//! Path index: torrent-relative paths mapped to file entries and pieces.
//!
//! Built once per torrent at ready time. Nodes live in an arena indexed by
//! integer ids so the tree carries no owning-pointer cycles; children are
//! kept in a `BTreeMap` which makes listings lexicographic for free.

use std::collections::BTreeMap;

use crate::torrent::{PieceIndex, TorrentMetadata};

/// Path resolution failures, each mapping to one wire error token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("file not found: {path}")]
    NotFound { path: String },

    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    #[error("is a directory: {path}")]
    IsADirectory { path: String },

    #[error("unsafe path: {path}")]
    Unsafe { path: String },
}

/// A file's position within the torrent's concatenated storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Ordered position within the torrent's file list.
    pub index: u32,
    /// POSIX-style relative path, `/`-separated.
    pub path: String,
    pub size: u64,
    /// Byte offset within the concatenated storage.
    pub offset: u64,
    pub first_piece: PieceIndex,
    pub last_piece: PieceIndex,
    pub offset_in_first_piece: u32,
}

impl FileEntry {
    /// File name component of the path.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Lowercased extension, if any.
    pub fn extension(&self) -> Option<String> {
        let name = self.file_name();
        name.rsplit_once('.')
            .filter(|(stem, _)| !stem.is_empty())
            .map(|(_, ext)| ext.to_ascii_lowercase())
    }
}

/// Result of a path lookup: a file entry or a directory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Located<'a> {
    File(&'a FileEntry),
    Dir { size: u64 },
}

/// A single `list` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    /// File size, or aggregate descendant size for directories.
    pub size: u64,
}

/// `stat` result for a file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatInfo {
    pub is_dir: bool,
    pub size: u64,
    pub file_index: Option<u32>,
}

#[derive(Debug)]
struct Node {
    children: BTreeMap<String, usize>,
    /// Aggregate size: own size for files, descendant sum for directories.
    size: u64,
    file: Option<u32>,
}

impl Node {
    fn dir() -> Self {
        Self {
            children: BTreeMap::new(),
            size: 0,
            file: None,
        }
    }

    fn is_dir(&self) -> bool {
        self.file.is_none()
    }
}

/// Trie over a torrent's file paths. Immutable after build.
#[derive(Debug)]
pub struct PathIndex {
    nodes: Vec<Node>,
    files: Vec<FileEntry>,
    piece_length: u64,
}

impl PathIndex {
    /// Builds the index from torrent metadata.
    ///
    /// File paths with empty, `.` or `..` components are skipped with a
    /// warning rather than failing the whole torrent.
    pub fn build(metadata: &TorrentMetadata) -> Self {
        let piece_length = u64::from(metadata.piece_length.max(1));
        let mut index = Self {
            nodes: vec![Node::dir()],
            files: Vec::with_capacity(metadata.files.len()),
            piece_length,
        };

        let mut offset = 0u64;
        for (i, file) in metadata.files.iter().enumerate() {
            let size = file.length;
            if file
                .path
                .iter()
                .any(|c| c.is_empty() || c == "." || c == "..")
                || file.path.is_empty()
            {
                tracing::warn!(path = ?file.path, "skipping file with unsafe path components");
                offset += size;
                continue;
            }

            let path = file.path.join("/");
            let entry = FileEntry {
                index: i as u32,
                path: path.clone(),
                size,
                offset,
                first_piece: PieceIndex::new((offset / piece_length) as u32),
                last_piece: PieceIndex::new(if size == 0 {
                    (offset / piece_length) as u32
                } else {
                    ((offset + size - 1) / piece_length) as u32
                }),
                offset_in_first_piece: (offset % piece_length) as u32,
            };
            index.insert(&file.path, entry);
            offset += size;
        }

        index
    }

    fn insert(&mut self, components: &[String], entry: FileEntry) {
        let size = entry.size;
        let file_slot = self.files.len() as u32;
        self.files.push(entry);

        let mut current = 0usize;
        self.nodes[0].size += size;
        for (depth, component) in components.iter().enumerate() {
            let next = match self.nodes[current].children.get(component) {
                Some(&id) => id,
                None => {
                    let id = self.nodes.len();
                    self.nodes.push(Node::dir());
                    self.nodes[current].children.insert(component.clone(), id);
                    id
                }
            };
            self.nodes[next].size += size;
            if depth + 1 == components.len() {
                self.nodes[next].file = Some(file_slot);
            }
            current = next;
        }
    }

    /// Normalizes a torrent-relative path into components.
    ///
    /// Collapses `//`, rejects absolute paths and `.`/`..` segments.
    pub fn normalize(path: &str) -> Result<Vec<&str>, PathError> {
        if path.starts_with('/') {
            return Err(PathError::Unsafe {
                path: path.to_string(),
            });
        }
        let mut components = Vec::new();
        for component in path.split('/') {
            if component.is_empty() {
                continue;
            }
            if component == "." || component == ".." {
                return Err(PathError::Unsafe {
                    path: path.to_string(),
                });
            }
            components.push(component);
        }
        Ok(components)
    }

    fn walk(&self, path: &str) -> Result<&Node, PathError> {
        let components = Self::normalize(path)?;
        let mut current = &self.nodes[0];
        for component in components {
            let next = current
                .children
                .get(component)
                .ok_or_else(|| PathError::NotFound {
                    path: path.to_string(),
                })?;
            current = &self.nodes[*next];
        }
        Ok(current)
    }

    /// Exact-match lookup of a file or directory.
    pub fn lookup(&self, path: &str) -> Result<Located<'_>, PathError> {
        let node = self.walk(path)?;
        match node.file {
            Some(slot) => Ok(Located::File(&self.files[slot as usize])),
            None => Ok(Located::Dir { size: node.size }),
        }
    }

    /// Resolves a path that must be a file.
    pub fn file(&self, path: &str) -> Result<&FileEntry, PathError> {
        match self.lookup(path)? {
            Located::File(entry) => Ok(entry),
            Located::Dir { .. } => Err(PathError::IsADirectory {
                path: path.to_string(),
            }),
        }
    }

    /// Lists a directory's immediate children in lexicographic order.
    pub fn list(&self, path: &str) -> Result<Vec<DirEntry>, PathError> {
        let node = self.walk(path)?;
        if !node.is_dir() {
            return Err(PathError::NotADirectory {
                path: path.to_string(),
            });
        }
        Ok(node
            .children
            .iter()
            .map(|(name, &id)| {
                let child = &self.nodes[id];
                DirEntry {
                    name: name.clone(),
                    is_dir: child.is_dir(),
                    size: child.size,
                }
            })
            .collect())
    }

    /// Metadata for a file or directory. Directory size is the sum of
    /// descendant file sizes.
    pub fn stat(&self, path: &str) -> Result<StatInfo, PathError> {
        let node = self.walk(path)?;
        Ok(StatInfo {
            is_dir: node.is_dir(),
            size: node.size,
            file_index: node
                .file
                .map(|slot| self.files[slot as usize].index),
        })
    }

    /// All file entries in torrent order.
    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Maps a byte range of a file to its piece span.
    ///
    /// Returns `(p0, p1, offset_in_p0)` for `[offset, offset+length)` of
    /// `file`, clamped to end-of-file. A zero-length effective range maps to
    /// the single piece containing `offset`.
    pub fn pieces_for(
        &self,
        file: &FileEntry,
        offset: u64,
        length: u64,
    ) -> (PieceIndex, PieceIndex, u32) {
        let start = file.offset + offset.min(file.size);
        let effective = length.min(file.size.saturating_sub(offset.min(file.size)));
        let p0 = start / self.piece_length;
        let p1 = if effective == 0 {
            p0
        } else {
            (start + effective - 1) / self.piece_length
        };
        (
            PieceIndex::new(p0 as u32),
            PieceIndex::new(p1 as u32),
            (start % self.piece_length) as u32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{InfoHash, TorrentFile, TorrentMetadata};

    fn metadata(files: &[(&str, u64)], piece_length: u32) -> TorrentMetadata {
        let total = files.iter().map(|(_, size)| size).sum();
        TorrentMetadata {
            info_hash: InfoHash::new([7u8; 20]),
            name: "test".to_string(),
            piece_length,
            piece_hashes: Vec::new(),
            total_length: total,
            files: files
                .iter()
                .map(|(path, size)| TorrentFile {
                    path: path.split('/').map(str::to_string).collect(),
                    length: *size,
                })
                .collect(),
            announce_urls: Vec::new(),
        }
    }

    #[test]
    fn lists_root_with_aggregate_dir_sizes() {
        let index = PathIndex::build(&metadata(
            &[("a/b.txt", 10), ("a/c.bin", 100), ("d.md", 5)],
            16,
        ));

        let entries = index.list("").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a");
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].size, 110);
        assert_eq!(entries[1].name, "d.md");
        assert!(!entries[1].is_dir);
        assert_eq!(entries[1].size, 5);
    }

    #[test]
    fn stat_distinguishes_files_and_dirs() {
        let index = PathIndex::build(&metadata(&[("a/b.txt", 10), ("d.md", 5)], 16));

        let dir = index.stat("a").unwrap();
        assert!(dir.is_dir);
        assert_eq!(dir.size, 10);
        assert_eq!(dir.file_index, None);

        let file = index.stat("a/b.txt").unwrap();
        assert!(!file.is_dir);
        assert_eq!(file.size, 10);
        assert_eq!(file.file_index, Some(0));
    }

    #[test]
    fn lookup_errors_are_distinct() {
        let index = PathIndex::build(&metadata(&[("a/b.txt", 10)], 16));

        assert!(matches!(
            index.lookup("missing"),
            Err(PathError::NotFound { .. })
        ));
        assert!(matches!(
            index.list("a/b.txt"),
            Err(PathError::NotADirectory { .. })
        ));
        assert!(matches!(
            index.file("a"),
            Err(PathError::IsADirectory { .. })
        ));
        assert!(matches!(
            index.lookup("/abs"),
            Err(PathError::Unsafe { .. })
        ));
        assert!(matches!(
            index.lookup("a/../b"),
            Err(PathError::Unsafe { .. })
        ));
    }

    #[test]
    fn double_slashes_collapse() {
        let index = PathIndex::build(&metadata(&[("a/b.txt", 10)], 16));
        assert!(matches!(index.lookup("a//b.txt"), Ok(Located::File(_))));
    }

    #[test]
    fn piece_geometry_spans_file_boundaries() {
        // Layout: a/b.txt [0,10), a/c.bin [10,110), d.md [110,115), pieces of 16.
        let index = PathIndex::build(&metadata(
            &[("a/b.txt", 10), ("a/c.bin", 100), ("d.md", 5)],
            16,
        ));

        let c = index.file("a/c.bin").unwrap();
        assert_eq!(c.offset, 10);
        assert_eq!(c.first_piece, PieceIndex::new(0));
        assert_eq!(c.last_piece, PieceIndex::new(6));
        assert_eq!(c.offset_in_first_piece, 10);

        let (p0, p1, off) = index.pieces_for(c, 6, 16);
        assert_eq!(p0, PieceIndex::new(1));
        assert_eq!(p1, PieceIndex::new(1));
        assert_eq!(off, 0);

        let (p0, p1, _) = index.pieces_for(c, 0, 100);
        assert_eq!(p0, PieceIndex::new(0));
        assert_eq!(p1, PieceIndex::new(6));
    }

    #[test]
    fn pieces_for_clamps_to_eof() {
        let index = PathIndex::build(&metadata(&[("d.md", 5)], 16));
        let d = index.file("d.md").unwrap();
        let (p0, p1, _) = index.pieces_for(d, 0, 1000);
        assert_eq!(p0, PieceIndex::new(0));
        assert_eq!(p1, PieceIndex::new(0));
    }

    #[test]
    fn extension_is_lowercased() {
        let index = PathIndex::build(&metadata(&[("Movies/Film.MKV", 10)], 16));
        let entry = index.file("Movies/Film.MKV").unwrap();
        assert_eq!(entry.extension().as_deref(), Some("mkv"));
    }
}
