//! Multi-torrent registry: lifecycle, name resolution, and aggregate
//! operations.

pub mod sources;
pub mod watcher;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};

use crate::cache::{self, CacheUsage, PruneOutcome};
use crate::config::DaemonConfig;
use crate::engine::{Engine, EngineError, FileProgress, StatusReport};
use crate::session::{PeerInfo, SessionAlert, SessionBackend, SessionError};
use crate::torrent::{MagnetParser, MetadataParser, TorrentError, TorrentId};
use sources::{SourceError, SourceItem, SourceRegistry};

/// Errors resolving the `torrent` field of a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("torrent required")]
    Required,

    #[error("torrent not found: {token}")]
    NotFound { token: String },

    #[error("torrent name ambiguous: {name}")]
    Ambiguous { name: String },
}

/// Manager-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("{message}")]
    BadRequest { message: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// One `torrents` row.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentRow {
    pub id: String,
    pub name: String,
    pub torrent_name: String,
    pub cache: String,
}

/// One `status-all` / `downloads` / `peers-all` per-torrent row.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentStatusRow {
    pub id: String,
    pub status: StatusReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileProgress>>,
}

/// `status-all` totals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusTotals {
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub peers: u32,
    pub seeds: u32,
}

/// Per-torrent peer listing row.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentPeersRow {
    pub id: String,
    pub peers: Vec<PeerInfo>,
}

/// The registry of loaded torrents plus everything that spans them.
pub struct TorrentManager {
    config: Arc<DaemonConfig>,
    config_path: Option<PathBuf>,
    session: Arc<dyn SessionBackend>,
    cache_root: PathBuf,
    watch_dir: Option<PathBuf>,
    skip_check: bool,
    engines: RwLock<HashMap<TorrentId, Arc<Engine>>>,
    /// Registry name (source-file stem) to ids, in load order.
    by_name: RwLock<HashMap<String, Vec<TorrentId>>>,
    by_source: RwLock<HashMap<PathBuf, TorrentId>>,
    checking_slots: Option<Arc<Semaphore>>,
    sources: SourceRegistry,
}

impl TorrentManager {
    pub fn new(
        config: Arc<DaemonConfig>,
        config_path: Option<PathBuf>,
        session: Arc<dyn SessionBackend>,
        cache_root: PathBuf,
        watch_dir: Option<PathBuf>,
        skip_check: bool,
    ) -> Arc<Self> {
        let checking_slots = match config.checking.max_active {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Arc::new(Self {
            skip_check: skip_check || config.skip_check,
            config,
            config_path,
            session,
            cache_root,
            watch_dir,
            engines: RwLock::new(HashMap::new()),
            by_name: RwLock::new(HashMap::new()),
            by_source: RwLock::new(HashMap::new()),
            checking_slots,
            sources: SourceRegistry::new(),
        })
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn watch_dir(&self) -> Option<&Path> {
        self.watch_dir.as_deref()
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    // -------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------

    /// Loads a `.torrent` file and registers its engine. Loading the same
    /// infohash twice is a no-op returning the existing id.
    pub async fn load_torrent_file(&self, path: &Path) -> Result<TorrentId, ManagerError> {
        let parser = MetadataParser::new(self.config.max_metadata_bytes());
        let metadata = parser.parse_file(path).await?;
        let id = TorrentId::from(metadata.info_hash);

        if self.engines.read().await.contains_key(&id) {
            tracing::debug!(id = %id, "torrent already loaded");
            return Ok(id);
        }

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| metadata.name.clone());
        let cache_dir = self.cache_root.join(id.as_str());

        // Bound how many torrents hash-check at once.
        let _permit = match (&self.checking_slots, self.skip_check) {
            (Some(slots), false) => slots.clone().acquire_owned().await.ok(),
            _ => None,
        };

        let engine = Engine::create(
            id.clone(),
            name.clone(),
            Some(path.to_path_buf()),
            metadata,
            cache_dir,
            self.session.clone(),
            self.config.clone(),
            self.skip_check,
        )
        .await?;

        self.engines.write().await.insert(id.clone(), engine.clone());
        self.by_name
            .write()
            .await
            .entry(name.clone())
            .or_default()
            .push(id.clone());
        self.by_source
            .write()
            .await
            .insert(path.to_path_buf(), id.clone());

        tracing::info!(id = %id, name = %name, "torrent loaded");

        if self.config.prefetch.on_start {
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.prefetch_path("").await {
                    tracing::warn!(id = %engine.id(), error = %e, "start prefetch failed");
                }
            });
        }

        Ok(id)
    }

    /// Tears down the torrent loaded from `path`. `purge` also wipes its
    /// cache subdirectory (the watched-removal path).
    pub async fn remove_source(&self, path: &Path, purge: bool) {
        let Some(id) = self.by_source.write().await.remove(path) else {
            return;
        };
        let engine = self.engines.write().await.remove(&id);
        if let Some(engine) = engine {
            let name = engine.name().to_string();
            let mut by_name = self.by_name.write().await;
            if let Some(ids) = by_name.get_mut(&name) {
                ids.retain(|known| known != &id);
                if ids.is_empty() {
                    by_name.remove(&name);
                }
            }
            drop(by_name);

            engine.shutdown("torrent removed from watch directory").await;
            tracing::info!(id = %id, name = %name, purge, "torrent removed");
        }
        if purge {
            cache::purge_subdir(&self.cache_root, id.as_str()).await;
        }
    }

    /// Whether a watched source file currently backs a loaded torrent.
    pub async fn has_source(&self, path: &Path) -> bool {
        self.by_source.read().await.contains_key(path)
    }

    /// Saves resume data for every loaded torrent.
    pub async fn save_all_resume(&self) {
        for engine in self.snapshot().await {
            if let Err(e) = engine.save_resume().await {
                tracing::warn!(id = %engine.id(), error = %e, "resume save failed");
            }
        }
    }

    /// Graceful teardown of every engine, registry intact (process exit).
    pub async fn shutdown_all(&self) {
        for engine in self.snapshot().await {
            engine.shutdown("daemon shutting down").await;
        }
    }

    async fn snapshot(&self) -> Vec<Arc<Engine>> {
        self.engines.read().await.values().cloned().collect()
    }

    // -------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------

    /// Resolves the request `torrent` token: exact id, then unique name,
    /// then the `name__<short-id>` disambiguated form.
    pub async fn resolve(&self, token: Option<&str>) -> Result<Arc<Engine>, ResolveError> {
        let token = match token {
            Some(t) if !t.is_empty() => t,
            _ => return Err(ResolveError::Required),
        };

        let engines = self.engines.read().await;
        if let Some(engine) = engines.get(&TorrentId::from_token(token)) {
            return Ok(engine.clone());
        }

        let by_name = self.by_name.read().await;
        if let Some(ids) = by_name.get(token) {
            return match ids.as_slice() {
                [only] => Ok(engines[only].clone()),
                _ => Err(ResolveError::Ambiguous {
                    name: token.to_string(),
                }),
            };
        }

        if let Some((base, short)) = token.rsplit_once("__")
            && let Some(ids) = by_name.get(base)
            && let Some(id) = ids.iter().find(|id| id.short() == short)
        {
            return Ok(engines[id].clone());
        }

        Err(ResolveError::NotFound {
            token: token.to_string(),
        })
    }

    /// Display name for an engine: the source-file stem, suffixed with the
    /// short id for every torrent after the first to claim it.
    async fn display_name(&self, engine: &Engine) -> String {
        let by_name = self.by_name.read().await;
        match by_name.get(engine.name()) {
            Some(ids) if ids.len() > 1 && ids.first() != Some(engine.id()) => {
                format!("{}__{}", engine.name(), engine.id().short())
            }
            _ => engine.name().to_string(),
        }
    }

    // -------------------------------------------------------------------
    // Aggregate queries
    // -------------------------------------------------------------------

    pub async fn list_torrents(&self) -> Vec<TorrentRow> {
        let mut rows = Vec::new();
        for engine in self.snapshot().await {
            rows.push(TorrentRow {
                id: engine.id().as_str().to_string(),
                name: self.display_name(&engine).await,
                torrent_name: engine.torrent_name().to_string(),
                cache: engine.cache_dir().display().to_string(),
            });
        }
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    pub async fn status_all(&self) -> (StatusTotals, Vec<TorrentStatusRow>) {
        let mut totals = StatusTotals::default();
        let mut rows = Vec::new();
        for engine in self.snapshot().await {
            let status = match engine.status().await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(id = %engine.id(), error = %e, "status unavailable");
                    continue;
                }
            };
            totals.downloaded += status.downloaded;
            totals.uploaded += status.uploaded;
            totals.download_rate += status.download_rate;
            totals.upload_rate += status.upload_rate;
            totals.peers += status.peers;
            totals.seeds += status.seeds;
            rows.push(TorrentStatusRow {
                id: engine.id().as_str().to_string(),
                status,
                files: None,
            });
        }
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        (totals, rows)
    }

    /// Torrents with missing pieces, with per-file progress rows.
    pub async fn downloads(&self, max_files: usize) -> Vec<TorrentStatusRow> {
        let mut rows = Vec::new();
        for engine in self.snapshot().await {
            let Ok(status) = engine.status().await else {
                continue;
            };
            if status.pieces_missing == 0 {
                continue;
            }
            let files = engine.file_progress(max_files).await.unwrap_or_default();
            rows.push(TorrentStatusRow {
                id: engine.id().as_str().to_string(),
                status,
                files: Some(files),
            });
        }
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    pub async fn peers_all(&self) -> Vec<TorrentPeersRow> {
        let mut rows = Vec::new();
        for engine in self.snapshot().await {
            rows.push(TorrentPeersRow {
                id: engine.id().as_str().to_string(),
                peers: engine.peers().await.unwrap_or_default(),
            });
        }
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    pub async fn reannounce_all(&self) {
        for engine in self.snapshot().await {
            if let Err(e) = engine.reannounce().await {
                tracing::warn!(id = %engine.id(), error = %e, "reannounce failed");
            }
        }
    }

    /// `cache-size`: have-fraction-weighted logical bytes plus the on-disk
    /// size of the cache root.
    pub async fn cache_usage(&self) -> CacheUsage {
        let mut logical = 0u64;
        for engine in self.snapshot().await {
            if let Ok(status) = engine.status().await {
                let total = engine.metadata().total_length;
                logical += (total as f64 * status.progress) as u64;
            }
        }
        let root = self.cache_root.clone();
        let disk = tokio::task::spawn_blocking(move || cache::disk_usage(&root))
            .await
            .unwrap_or(0);
        CacheUsage {
            logical_bytes: logical,
            disk_bytes: disk,
        }
    }

    /// `prune-cache`: removes orphaned cache subdirectories.
    pub async fn prune_cache(&self, dry_run: bool) -> Result<PruneOutcome, ManagerError> {
        let owned: BTreeSet<String> = self
            .engines
            .read()
            .await
            .keys()
            .map(|id| id.as_str().to_string())
            .collect();
        Ok(cache::prune(&self.cache_root, &owned, dry_run).await?)
    }

    // -------------------------------------------------------------------
    // Magnet / source intake
    // -------------------------------------------------------------------

    /// Fetches magnet metadata and drops the `.torrent` into the watched
    /// directory under a stable name; the watcher completes creation.
    pub async fn add_magnet(&self, magnet_uri: &str) -> Result<TorrentId, ManagerError> {
        let link = MagnetParser::parse(magnet_uri)?;
        let Some(watch_dir) = &self.watch_dir else {
            return Err(ManagerError::BadRequest {
                message: "no torrent directory configured; pass --torrent-dir".to_string(),
            });
        };

        let torrent_bytes = self.session.fetch_magnet(magnet_uri).await?;
        let parser = MetadataParser::new(self.config.max_metadata_bytes());
        let metadata = parser.parse_bytes(&torrent_bytes)?;
        let id = TorrentId::from(metadata.info_hash);
        if id != TorrentId::from(link.info_hash) {
            tracing::warn!(
                magnet = %link.info_hash,
                fetched = %id,
                "magnet info hash differs from fetched metadata"
            );
        }

        let final_path = watch_dir.join(format!("{}.torrent", id.as_str()));
        let tmp_path = watch_dir.join(format!(".{}.torrent.tmp", id.as_str()));
        tokio::fs::write(&tmp_path, &torrent_bytes).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        tracing::info!(id = %id, path = %final_path.display(), "magnet written to watch directory");
        Ok(id)
    }

    /// `source-add`: resolves the source string through the plugin
    /// registry and acts on the resulting items.
    pub async fn source_add(&self, source: &str) -> Result<TorrentId, ManagerError> {
        let items = self.sources.resolve(source)?;
        let mut last = None;
        for item in items {
            match item {
                SourceItem::Magnet { uri } => last = Some(self.add_magnet(&uri).await?),
            }
        }
        last.ok_or_else(|| ManagerError::BadRequest {
            message: format!("source {source:?} resolved to nothing"),
        })
    }

    // -------------------------------------------------------------------
    // Background tasks
    // -------------------------------------------------------------------

    /// Drains session alerts into per-torrent signals. Runs until the
    /// session's alert channel closes.
    pub async fn run_alert_pump(self: Arc<Self>) {
        let mut alerts = self.session.subscribe_alerts();
        loop {
            match alerts.recv().await {
                Ok(alert) => {
                    let engines = self.engines.read().await;
                    let Some(engine) = engines.get(alert.torrent_id()) else {
                        continue;
                    };
                    match alert {
                        SessionAlert::TorrentFault { message, .. } => engine.note_fault(message),
                        SessionAlert::PieceFinished { .. }
                        | SessionAlert::FileCompleted { .. }
                        | SessionAlert::MetadataReceived { .. } => engine.signal().bump(),
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    // Waiters re-check piece state on every wake, so a
                    // lagged pump only costs an extra bump.
                    tracing::warn!(missed, "alert stream lagged");
                    for engine in self.snapshot().await {
                        engine.signal().bump();
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!("alert pump stopped");
    }

    /// Periodically snapshots resume data for every torrent.
    pub async fn run_resume_saver(self: Arc<Self>) {
        let interval_s = self.config.resume.save_interval_s;
        if interval_s == 0 {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_s));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.save_all_resume().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::sim::SimSession;
    use crate::torrent::TorrentBuilder;

    async fn write_torrent(
        dir: &Path,
        file_name: &str,
        built: &crate::torrent::creation::BuiltTorrent,
    ) -> PathBuf {
        let path = dir.join(file_name);
        tokio::fs::write(&path, &built.torrent_bytes).await.unwrap();
        path
    }

    async fn manager_with(session: SimSession, cache_root: &Path) -> Arc<TorrentManager> {
        TorrentManager::new(
            Arc::new(DaemonConfig::default()),
            None,
            Arc::new(session),
            cache_root.to_path_buf(),
            None,
            true,
        )
    }

    #[tokio::test]
    async fn name_collision_disambiguates_and_resolution_rules_hold() {
        let dir = tempfile::tempdir().unwrap();
        let torrents = dir.path().join("torrents");
        tokio::fs::create_dir(&torrents).await.unwrap();

        let first = TorrentBuilder::new("one", 16).file("a", vec![1; 32]).build();
        let second = TorrentBuilder::new("two", 16).file("b", vec![2; 32]).build();

        // Both .torrent files share the basename "movie" via subdirs.
        let dir_a = torrents.join("a");
        let dir_b = torrents.join("b");
        tokio::fs::create_dir_all(&dir_a).await.unwrap();
        tokio::fs::create_dir_all(&dir_b).await.unwrap();
        let path_a = write_torrent(&dir_a, "movie.torrent", &first).await;
        let path_b = write_torrent(&dir_b, "movie.torrent", &second).await;

        let manager = manager_with(SimSession::new(), &dir.path().join("cache")).await;
        let id_a = manager.load_torrent_file(&path_a).await.unwrap();
        let id_b = manager.load_torrent_file(&path_b).await.unwrap();
        assert_ne!(id_a, id_b);

        // The second torrent lists under the disambiguated name.
        let rows = manager.list_torrents().await;
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"movie"));
        let disambiguated = format!("movie__{}", id_b.short());
        assert!(names.contains(&disambiguated.as_str()), "{names:?}");

        // Bare name is ambiguous; exact id and disambiguated form resolve.
        assert!(matches!(
            manager.resolve(Some("movie")).await,
            Err(ResolveError::Ambiguous { .. })
        ));
        assert_eq!(
            manager.resolve(Some(id_a.as_str())).await.unwrap().id(),
            &id_a
        );
        assert_eq!(
            manager.resolve(Some(&disambiguated)).await.unwrap().id(),
            &id_b
        );
        assert!(matches!(
            manager.resolve(Some("missing")).await,
            Err(ResolveError::NotFound { .. })
        ));
        assert!(matches!(
            manager.resolve(None).await,
            Err(ResolveError::Required)
        ));
    }

    #[tokio::test]
    async fn duplicate_load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let built = TorrentBuilder::new("t", 16).file("a", vec![1; 32]).build();
        let path = write_torrent(dir.path(), "t.torrent", &built).await;

        let manager = manager_with(SimSession::new(), &dir.path().join("cache")).await;
        let id1 = manager.load_torrent_file(&path).await.unwrap();
        let id2 = manager.load_torrent_file(&path).await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(manager.list_torrents().await.len(), 1);
    }

    #[tokio::test]
    async fn prune_never_touches_loaded_torrents() {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = dir.path().join("cache");
        let built = TorrentBuilder::new("t", 16).file("a", vec![1; 32]).build();
        let path = write_torrent(dir.path(), "t.torrent", &built).await;

        let manager = manager_with(SimSession::new(), &cache_root).await;
        let id = manager.load_torrent_file(&path).await.unwrap();

        tokio::fs::create_dir_all(cache_root.join("deadbeef")).await.unwrap();

        let outcome = manager.prune_cache(true).await.unwrap();
        assert_eq!(outcome.removed, vec!["deadbeef"]);
        assert_eq!(outcome.skipped, vec![id.as_str().to_string()]);
        assert!(cache_root.join("deadbeef").is_dir());

        let outcome = manager.prune_cache(false).await.unwrap();
        assert_eq!(outcome.removed, vec!["deadbeef"]);
        assert!(!cache_root.join("deadbeef").exists());
        assert!(cache_root.join(id.as_str()).is_dir());
    }

    #[tokio::test]
    async fn remove_source_purges_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = dir.path().join("cache");
        let built = TorrentBuilder::new("t", 16).file("a", vec![1; 32]).build();
        let path = write_torrent(dir.path(), "t.torrent", &built).await;

        let manager = manager_with(SimSession::new(), &cache_root).await;
        let id = manager.load_torrent_file(&path).await.unwrap();
        assert!(cache_root.join(id.as_str()).is_dir());

        manager.remove_source(&path, true).await;
        assert!(manager.list_torrents().await.is_empty());
        assert!(!cache_root.join(id.as_str()).exists());
        assert!(matches!(
            manager.resolve(Some(id.as_str())).await,
            Err(ResolveError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn add_magnet_requires_watch_dir_and_writes_stable_name() {
        let dir = tempfile::tempdir().unwrap();
        let built = TorrentBuilder::new("t", 16).file("a", vec![1; 32]).build();
        let id = TorrentId::from(built.metadata.info_hash);
        let magnet = format!("magnet:?xt=urn:btih:{}", id.as_str());

        let session = SimSession::new();
        session
            .register_magnet(&magnet, built.torrent_bytes.clone())
            .await;

        // Without a watch dir the request is rejected up front.
        let manager = manager_with(session.clone(), &dir.path().join("cache")).await;
        assert!(matches!(
            manager.add_magnet(&magnet).await,
            Err(ManagerError::BadRequest { .. })
        ));

        let watch = dir.path().join("watch");
        tokio::fs::create_dir(&watch).await.unwrap();
        let manager = TorrentManager::new(
            Arc::new(DaemonConfig::default()),
            None,
            Arc::new(session),
            dir.path().join("cache"),
            Some(watch.clone()),
            true,
        );
        let added = manager.add_magnet(&magnet).await.unwrap();
        assert_eq!(added, id);
        assert!(watch.join(format!("{}.torrent", id.as_str())).is_file());
    }
}
