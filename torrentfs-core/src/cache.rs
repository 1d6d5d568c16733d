//! Cache root lifecycle: size accounting and pruning of orphaned
//! per-torrent subdirectories.

use std::collections::BTreeSet;
use std::path::Path;

/// `cache-size` totals.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CacheUsage {
    /// Sum of torrent sizes weighted by their have-fraction.
    pub logical_bytes: u64,
    /// Actual bytes on disk under the cache root.
    pub disk_bytes: u64,
}

/// `prune-cache` result: `<id>` directory names.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PruneOutcome {
    pub removed: Vec<String>,
    pub skipped: Vec<String>,
}

/// On-disk size of a directory tree.
pub fn disk_usage(root: &Path) -> u64 {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Removes `<id>` subdirectories of `cache_root` not owned by any loaded
/// torrent. `dry_run` reports candidates without touching the filesystem.
/// Directories of loaded torrents are never removed.
pub async fn prune(
    cache_root: &Path,
    owned_ids: &BTreeSet<String>,
    dry_run: bool,
) -> std::io::Result<PruneOutcome> {
    let mut outcome = PruneOutcome::default();

    let mut entries = match tokio::fs::read_dir(cache_root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(outcome),
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if owned_ids.contains(&name) {
            outcome.skipped.push(name);
        } else {
            if !dry_run {
                purge_subdir(cache_root, &name).await;
            }
            outcome.removed.push(name);
        }
    }

    outcome.removed.sort();
    outcome.skipped.sort();
    Ok(outcome)
}

/// Best-effort rename-then-rmtree so a crash mid-removal leaves an
/// obviously-dead directory instead of a half-valid cache entry.
pub async fn purge_subdir(cache_root: &Path, name: &str) {
    let path = cache_root.join(name);
    let doomed = cache_root.join(format!(".prune-{name}"));
    let target = match tokio::fs::rename(&path, &doomed).await {
        Ok(()) => doomed,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "prune rename failed, removing in place");
            path
        }
    };
    if let Err(e) = tokio::fs::remove_dir_all(&target).await {
        tracing::warn!(path = %target.display(), error = %e, "prune removal failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn dry_run_reports_without_removing() {
        let root = tempfile::tempdir().unwrap();
        for name in ["A", "B", "C", "D"] {
            tokio::fs::create_dir(root.path().join(name)).await.unwrap();
        }

        let outcome = prune(root.path(), &owned(&["A", "B"]), true).await.unwrap();
        assert_eq!(outcome.removed, vec!["C", "D"]);
        assert_eq!(outcome.skipped, vec!["A", "B"]);

        for name in ["A", "B", "C", "D"] {
            assert!(root.path().join(name).is_dir(), "{name} must survive dry run");
        }
    }

    #[tokio::test]
    async fn prune_removes_only_orphans() {
        let root = tempfile::tempdir().unwrap();
        for name in ["A", "C"] {
            tokio::fs::create_dir(root.path().join(name)).await.unwrap();
            tokio::fs::write(root.path().join(name).join("payload"), b"x")
                .await
                .unwrap();
        }

        let outcome = prune(root.path(), &owned(&["A"]), false).await.unwrap();
        assert_eq!(outcome.removed, vec!["C"]);
        assert_eq!(outcome.skipped, vec!["A"]);
        assert!(root.path().join("A").is_dir());
        assert!(!root.path().join("C").exists());
    }

    #[tokio::test]
    async fn missing_cache_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("nope");
        let outcome = prune(&missing, &owned(&[]), false).await.unwrap();
        assert!(outcome.removed.is_empty());
        assert!(outcome.skipped.is_empty());
    }

    #[test]
    fn disk_usage_sums_files() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("sub")).unwrap();
        std::fs::write(root.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::write(root.path().join("sub").join("b"), vec![0u8; 50]).unwrap();
        assert_eq!(disk_usage(root.path()), 150);
    }
}
