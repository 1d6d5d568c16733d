//! Watched-directory poll loop.
//!
//! Polling keeps the watcher portable. Each tick diffs the `*.torrent`
//! files against the registry: removals tear engines down (purging their
//! cache), additions load once the file size is stable across two polls.
//! A rename therefore lands as remove-then-add within one tick. Failed
//! loads retry with capped exponential backoff.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::TorrentManager;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct PendingLoad {
    last_error: String,
    attempts: u32,
    next_try: Instant,
}

/// One candidate file observed last tick, for the stability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observed {
    size: u64,
}

/// Polls a directory of `.torrent` files and drives engine lifecycle.
pub struct DirWatcher {
    manager: Arc<TorrentManager>,
    dir: PathBuf,
    interval: Duration,
    observed: HashMap<PathBuf, Observed>,
    pending: HashMap<PathBuf, PendingLoad>,
    loaded: HashSet<PathBuf>,
}

impl DirWatcher {
    pub fn new(manager: Arc<TorrentManager>, dir: PathBuf) -> Self {
        let interval =
            Duration::from_millis(manager.config().watch.poll_interval_ms.max(100));
        Self {
            manager,
            dir,
            interval,
            observed: HashMap::new(),
            pending: HashMap::new(),
            loaded: HashSet::new(),
        }
    }

    /// Runs the poll loop forever. Scan errors are logged and isolated.
    pub async fn run(mut self) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            tracing::error!(dir = %self.dir.display(), error = %e, "cannot create watch directory");
            return;
        }
        tracing::info!(dir = %self.dir.display(), "watching for .torrent files");

        loop {
            if let Err(e) = self.tick().await {
                tracing::warn!(dir = %self.dir.display(), error = %e, "watcher scan failed");
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One poll: removals first, then stable additions.
    async fn tick(&mut self) -> std::io::Result<()> {
        let current = self.scan().await?;

        // Removals before additions so a rename observed in one tick is
        // handled as remove-then-add.
        let gone: Vec<PathBuf> = self
            .loaded
            .iter()
            .filter(|path| !current.contains_key(*path))
            .cloned()
            .collect();
        for path in gone {
            self.loaded.remove(&path);
            self.observed.remove(&path);
            self.pending.remove(&path);
            self.manager.remove_source(&path, true).await;
        }
        self.observed.retain(|path, _| current.contains_key(path));

        for (path, size) in current {
            if self.loaded.contains(&path) {
                continue;
            }
            if let Some(pending) = self.pending.get(&path)
                && Instant::now() < pending.next_try
            {
                continue;
            }

            // Require a stable, non-empty size across two polls so a file
            // still being written is not parsed half-way.
            let stable = self.observed.get(&path) == Some(&Observed { size }) && size > 0;
            self.observed.insert(path.clone(), Observed { size });
            if !stable {
                continue;
            }

            match self.manager.load_torrent_file(&path).await {
                Ok(_) => {
                    self.loaded.insert(path.clone());
                    self.pending.remove(&path);
                }
                Err(e) => self.note_failure(path, e.to_string()),
            }
        }
        Ok(())
    }

    async fn scan(&self) -> std::io::Result<HashMap<PathBuf, u64>> {
        let mut current = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "torrent") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            current.insert(path, meta.len());
        }
        Ok(current)
    }

    fn note_failure(&mut self, path: PathBuf, error: String) {
        let attempts = self
            .pending
            .get(&path)
            .map(|p| p.attempts + 1)
            .unwrap_or(1);
        let delay = (self.interval * 2u32.saturating_pow(attempts.min(6) - 1)).min(MAX_BACKOFF);

        // Log each distinct error once, not once per retry.
        let changed = self
            .pending
            .get(&path)
            .is_none_or(|p| p.last_error != error);
        if changed {
            tracing::warn!(path = %path.display(), error = %error, "failed to load torrent, will retry");
        }

        self.pending.insert(
            path,
            PendingLoad {
                last_error: error,
                attempts,
                next_try: Instant::now() + delay,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::session::sim::SimSession;
    use crate::torrent::{TorrentBuilder, TorrentId};

    async fn watcher_fixture() -> (tempfile::TempDir, Arc<TorrentManager>, DirWatcher) {
        let dir = tempfile::tempdir().unwrap();
        let watch = dir.path().join("watch");
        tokio::fs::create_dir(&watch).await.unwrap();
        let manager = TorrentManager::new(
            Arc::new(DaemonConfig::default()),
            None,
            Arc::new(SimSession::new()),
            dir.path().join("cache"),
            Some(watch.clone()),
            true,
        );
        let watcher = DirWatcher::new(manager.clone(), watch);
        (dir, manager, watcher)
    }

    #[tokio::test]
    async fn add_requires_two_stable_polls() {
        let (dir, manager, mut watcher) = watcher_fixture().await;
        let built = TorrentBuilder::new("t", 16).file("a", vec![1; 32]).build();
        let path = dir.path().join("watch").join("t.torrent");
        tokio::fs::write(&path, &built.torrent_bytes).await.unwrap();

        watcher.tick().await.unwrap();
        assert!(manager.list_torrents().await.is_empty());

        watcher.tick().await.unwrap();
        assert_eq!(manager.list_torrents().await.len(), 1);
        assert!(manager.has_source(&path).await);
    }

    #[tokio::test]
    async fn removal_tears_down_and_purges() {
        let (dir, manager, mut watcher) = watcher_fixture().await;
        let built = TorrentBuilder::new("t", 16).file("a", vec![1; 32]).build();
        let id = TorrentId::from(built.metadata.info_hash);
        let path = dir.path().join("watch").join("t.torrent");
        tokio::fs::write(&path, &built.torrent_bytes).await.unwrap();

        watcher.tick().await.unwrap();
        watcher.tick().await.unwrap();
        assert_eq!(manager.list_torrents().await.len(), 1);
        let cache_dir = dir.path().join("cache").join(id.as_str());
        assert!(cache_dir.is_dir());

        tokio::fs::remove_file(&path).await.unwrap();
        watcher.tick().await.unwrap();
        assert!(manager.list_torrents().await.is_empty());
        assert!(!cache_dir.exists());
    }

    #[tokio::test]
    async fn invalid_torrent_backs_off_instead_of_spamming() {
        let (dir, manager, mut watcher) = watcher_fixture().await;
        let path = dir.path().join("watch").join("broken.torrent");
        tokio::fs::write(&path, b"not a torrent").await.unwrap();

        watcher.tick().await.unwrap();
        watcher.tick().await.unwrap();
        assert!(manager.list_torrents().await.is_empty());
        assert!(watcher.pending.contains_key(&path));

        // Still pending: the backoff window hasn't elapsed, so another tick
        // does not retry (attempts stays put).
        let attempts = watcher.pending[&path].attempts;
        watcher.tick().await.unwrap();
        assert_eq!(watcher.pending[&path].attempts, attempts);
    }

    #[tokio::test]
    async fn non_torrent_files_are_ignored() {
        let (dir, manager, mut watcher) = watcher_fixture().await;
        tokio::fs::write(dir.path().join("watch").join("readme.txt"), b"hi")
            .await
            .unwrap();
        watcher.tick().await.unwrap();
        watcher.tick().await.unwrap();
        assert!(manager.list_torrents().await.is_empty());
    }
}
