//! Persistent per-torrent pin set.
//!
//! Stored as a JSON array of path strings at `cache_dir/.pinned.json`,
//! overwritten via tempfile + atomic rename. Loads tolerate missing,
//! truncated, or invalid files by falling back to an empty set.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// On-disk pin file name inside a torrent's cache directory.
pub const PIN_FILE: &str = ".pinned.json";

/// The pin set plus its backing file.
#[derive(Debug)]
pub struct PinStore {
    file_path: PathBuf,
    set: BTreeSet<String>,
}

impl PinStore {
    /// Loads the pin set from `cache_dir`, tolerating corrupt state.
    pub async fn load(cache_dir: &Path) -> Self {
        let file_path = cache_dir.join(PIN_FILE);
        let set = match tokio::fs::read(&file_path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<String>>(&bytes) {
                Ok(paths) => paths.into_iter().collect(),
                Err(e) => {
                    tracing::warn!(
                        path = %file_path.display(),
                        error = %e,
                        "invalid pin file, starting with empty pin set"
                    );
                    BTreeSet::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                tracing::warn!(
                    path = %file_path.display(),
                    error = %e,
                    "unreadable pin file, starting with empty pin set"
                );
                BTreeSet::new()
            }
        };
        Self { file_path, set }
    }

    /// Writes the set via tempfile + rename so a crash never leaves a
    /// half-written pin file.
    pub async fn persist(&self) -> std::io::Result<()> {
        let paths: Vec<&String> = self.set.iter().collect();
        let json = serde_json::to_vec_pretty(&paths)?;
        let tmp_path = self.file_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &self.file_path).await?;
        Ok(())
    }

    pub fn insert(&mut self, path: &str) -> bool {
        self.set.insert(path.to_string())
    }

    pub fn remove(&mut self, path: &str) -> bool {
        self.set.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.set.contains(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.set.iter()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Drops entries rejected by `keep`, returning how many were removed.
    /// Used at load time to discard pins that no longer resolve.
    pub fn retain<F: FnMut(&str) -> bool>(&mut self, mut keep: F) -> usize {
        let before = self.set.len();
        self.set.retain(|path| keep(path));
        before - self.set.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PinStore::load(dir.path()).await;
        assert!(store.is_empty());

        store.insert("a/b.txt");
        store.insert("c.bin");
        store.persist().await.unwrap();

        let reloaded = PinStore::load(dir.path()).await;
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("a/b.txt"));
        assert!(reloaded.contains("c.bin"));
    }

    #[tokio::test]
    async fn double_insert_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PinStore::load(dir.path()).await;

        store.insert("a/b.txt");
        store.persist().await.unwrap();
        let first = tokio::fs::read(dir.path().join(PIN_FILE)).await.unwrap();

        assert!(!store.insert("a/b.txt"));
        store.persist().await.unwrap();
        let second = tokio::fs::read(dir.path().join(PIN_FILE)).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(PIN_FILE), b"{truncated")
            .await
            .unwrap();

        let store = PinStore::load(dir.path()).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn retain_drops_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PinStore::load(dir.path()).await;
        store.insert("kept");
        store.insert("stale");

        let dropped = store.retain(|p| p == "kept");
        assert_eq!(dropped, 1);
        assert!(store.contains("kept"));
        assert!(!store.contains("stale"));
    }
}
