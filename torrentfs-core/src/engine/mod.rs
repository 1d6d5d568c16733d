//! Per-torrent engine: path index, read scheduler, prefetch, and pins
//! integrated around one session handle.

pub mod pins;
pub mod prefetch;
pub mod reads;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

pub use reads::{CancelToken, MAX_READ_BYTES, PieceSignal, ReadError, ReadMode};

use crate::config::DaemonConfig;
use crate::index::{DirEntry, Located, PathError, PathIndex, StatInfo};
use crate::session::{
    PRIORITY_DEFAULT, PRIORITY_PREFETCH, PRIORITY_TOP, AddTorrentParams, PeerInfo, SessionBackend,
    SessionError, TorrentState,
};
use crate::torrent::{PieceIndex, TorrentId, TorrentMetadata};
use pins::PinStore;
use prefetch::{PrefetchState, ProfileChoice};
use reads::{OutstandingRead, OutstandingReads};

/// On-disk resume blob name inside a torrent's cache directory.
pub const RESUME_FILE: &str = "resume.dat";

/// Engine-level failures outside the read path.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// `status` response payload.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub name: String,
    pub state: String,
    pub progress: f64,
    pub peers: u32,
    pub seeds: u32,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub pieces_total: u32,
    pub pieces_done: u32,
    pub pieces_missing: u32,
    pub checking: bool,
    pub checking_progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `file-info` response payload.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfoReport {
    pub path: String,
    pub size: u64,
    pub file_index: u32,
    pub piece_length: u32,
    pub first_piece: u32,
    pub last_piece: u32,
    pub pieces_total: u32,
    pub have_pieces: u32,
    pub pieces_missing: u32,
}

/// `prefetch-info` response payload.
#[derive(Debug, Clone, Serialize)]
pub struct PrefetchInfoReport {
    pub path: String,
    pub size: u64,
    pub head_bytes: u64,
    pub tail_bytes: u64,
    pub head_pieces: u32,
    pub tail_pieces: u32,
    pub have_head: bool,
    pub have_tail: bool,
}

/// One `pinned` row.
#[derive(Debug, Clone, Serialize)]
pub struct PinRow {
    pub path: String,
    pub file_name: String,
    pub torrent_name: String,
    pub size: u64,
}

/// Per-file progress row for `downloads`.
#[derive(Debug, Clone, Serialize)]
pub struct FileProgress {
    pub path: String,
    pub size: u64,
    pub remaining: u64,
    pub progress_pct: f64,
}

/// A loaded torrent: session handle, path index, scheduler state.
pub struct Engine {
    id: TorrentId,
    name: String,
    source_path: Option<PathBuf>,
    metadata: TorrentMetadata,
    index: PathIndex,
    cache_dir: PathBuf,
    session: Arc<dyn SessionBackend>,
    config: Arc<DaemonConfig>,
    signal: Arc<PieceSignal>,
    fatal: std::sync::Mutex<Option<String>>,
    /// Serializes every piece-priority mutation for this torrent.
    priority_lock: tokio::sync::Mutex<()>,
    pins: tokio::sync::Mutex<PinStore>,
    prefetch: tokio::sync::Mutex<PrefetchState>,
    reads: std::sync::Mutex<OutstandingReads>,
}

impl Engine {
    /// Loads a torrent: builds the index, feeds resume data back to the
    /// session, restores pins, and applies pin priorities.
    pub async fn create(
        id: TorrentId,
        name: String,
        source_path: Option<PathBuf>,
        metadata: TorrentMetadata,
        cache_dir: PathBuf,
        session: Arc<dyn SessionBackend>,
        config: Arc<DaemonConfig>,
        skip_check: bool,
    ) -> Result<Arc<Self>, EngineError> {
        tokio::fs::create_dir_all(&cache_dir).await?;

        let index = PathIndex::build(&metadata);

        let resume_path = cache_dir.join(RESUME_FILE);
        let resume_data = match tokio::fs::read(&resume_path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "unreadable resume data, ignoring");
                None
            }
        };

        let trackers = config.trackers.expand(&metadata.announce_urls);
        session
            .add_torrent(AddTorrentParams {
                id: id.clone(),
                metadata: metadata.clone(),
                save_dir: cache_dir.clone(),
                trackers,
                resume_data,
                skip_check,
            })
            .await?;

        let mut pin_store = PinStore::load(&cache_dir).await;
        let dropped = pin_store.retain(|path| index.file(path).is_ok());
        if dropped > 0 {
            tracing::warn!(id = %id, dropped, "dropped pins that no longer resolve");
            if let Err(e) = pin_store.persist().await {
                tracing::warn!(id = %id, error = %e, "failed to rewrite pin file");
            }
        }

        let engine = Arc::new(Self {
            id,
            name,
            source_path,
            metadata,
            index,
            cache_dir,
            session,
            config,
            signal: Arc::new(PieceSignal::new()),
            fatal: std::sync::Mutex::new(None),
            priority_lock: tokio::sync::Mutex::new(()),
            pins: tokio::sync::Mutex::new(pin_store),
            prefetch: tokio::sync::Mutex::new(PrefetchState::default()),
            reads: std::sync::Mutex::new(OutstandingReads::default()),
        });

        engine.apply_pin_priorities().await?;
        Ok(engine)
    }

    pub fn id(&self) -> &TorrentId {
        &self.id
    }

    /// Registry name: basename of the source `.torrent` file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metadata-provided torrent name.
    pub fn torrent_name(&self) -> &str {
        &self.metadata.name
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn metadata(&self) -> &TorrentMetadata {
        &self.metadata
    }

    /// Piece-arrival signal, bumped by the alerts pump.
    pub fn signal(&self) -> &Arc<PieceSignal> {
        &self.signal
    }

    /// Records a fatal session fault and wakes every waiting read.
    pub fn note_fault(&self, message: String) {
        let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if fatal.is_none() {
            tracing::warn!(id = %self.id, error = %message, "torrent entered error state");
            *fatal = Some(message);
        }
        drop(fatal);
        self.signal.bump();
    }

    fn fatal(&self) -> Option<String> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // -------------------------------------------------------------------
    // Path operations
    // -------------------------------------------------------------------

    pub fn list(&self, path: &str) -> Result<Vec<DirEntry>, PathError> {
        self.index.list(path)
    }

    pub fn stat(&self, path: &str) -> Result<StatInfo, PathError> {
        self.index.stat(path)
    }

    pub async fn file_info(&self, path: &str) -> Result<FileInfoReport, EngineError> {
        let entry = self.index.file(path)?.clone();
        let bitfield = self.session.piece_bitfield(&self.id).await?;

        let first = entry.first_piece.as_u32();
        let last = entry.last_piece.as_u32();
        let total = last - first + 1;
        let have = (first..=last)
            .filter(|&p| bitfield.get(p as usize).copied().unwrap_or(false))
            .count() as u32;

        Ok(FileInfoReport {
            path: entry.path.clone(),
            size: entry.size,
            file_index: entry.index,
            piece_length: self.metadata.piece_length,
            first_piece: first,
            last_piece: last,
            pieces_total: total,
            have_pieces: have,
            pieces_missing: total - have,
        })
    }

    // -------------------------------------------------------------------
    // Read scheduler
    // -------------------------------------------------------------------

    /// Reads `size` bytes at `offset`, waiting for pieces per `mode`.
    ///
    /// # Errors
    /// - `ReadError::SizeInvalid` - `size` outside `(0, 16 MiB]`
    /// - `ReadError::WouldBlock` - non-wait mode with nothing available
    /// - `ReadError::Timeout` / `ReadError::Cancelled`
    /// - `ReadError::Torrent` - the session reported a fatal state
    pub async fn read(
        &self,
        path: &str,
        offset: u64,
        size: u64,
        mode: ReadMode,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, ReadError> {
        if size == 0 || size > MAX_READ_BYTES {
            return Err(ReadError::SizeInvalid);
        }
        let entry = self.index.file(path)?.clone();

        // Reads never cross end-of-file.
        if offset >= entry.size {
            return Ok(Vec::new());
        }
        let effective = size.min(entry.size - offset);
        let (p0, p1, _) = self.index.pieces_for(&entry, offset, effective);
        let global_start = entry.offset + offset;

        if let Some(message) = self.fatal() {
            return Err(ReadError::Torrent { message });
        }

        if !mode.waits() {
            return self.read_available(p0, p1, global_start, effective).await;
        }

        let read_id = self
            .reads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(OutstandingRead {
                first_piece: p0,
                last_piece: p1,
            });

        let result = self
            .read_waiting(p0, p1, global_start, effective, timeout, cancel)
            .await;
        self.finish_read(read_id, p0, p1).await;
        result
    }

    /// Non-wait read: serves the contiguous available prefix.
    async fn read_available(
        &self,
        p0: PieceIndex,
        p1: PieceIndex,
        global_start: u64,
        effective: u64,
    ) -> Result<Vec<u8>, ReadError> {
        let bitfield = self.session.piece_bitfield(&self.id).await?;
        let mut last_have = None;
        for p in p0.as_u32()..=p1.as_u32() {
            if bitfield.get(p as usize).copied().unwrap_or(false) {
                last_have = Some(p);
            } else {
                break;
            }
        }
        let Some(last_have) = last_have else {
            return Err(ReadError::WouldBlock);
        };

        let piece_length = u64::from(self.metadata.piece_length);
        let available_end = (u64::from(last_have) + 1) * piece_length;
        let len = effective.min(available_end - global_start);
        Ok(self
            .session
            .read(&self.id, global_start, len as usize)
            .await?)
    }

    async fn read_waiting(
        &self,
        p0: PieceIndex,
        p1: PieceIndex,
        global_start: u64,
        effective: u64,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, ReadError> {
        self.raise_read_priorities(p0, p1).await?;

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let generation = self.signal.generation();

            if let Some(message) = self.fatal() {
                return Err(ReadError::Torrent { message });
            }
            if cancel.is_cancelled() {
                return Err(ReadError::Cancelled);
            }

            let bitfield = self.session.piece_bitfield(&self.id).await?;
            let complete = (p0.as_u32()..=p1.as_u32())
                .all(|p| bitfield.get(p as usize).copied().unwrap_or(false));
            if complete {
                break;
            }

            let wait = self.signal.wait_past(generation);
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = wait => {}
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep_until(at) => return Err(ReadError::Timeout),
                    }
                }
                None => {
                    tokio::select! {
                        _ = wait => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }

        Ok(self
            .session
            .read(&self.id, global_start, effective as usize)
            .await?)
    }

    /// Raises the read range to top priority and spaces deadlines so
    /// earlier pieces land first.
    async fn raise_read_priorities(&self, p0: PieceIndex, p1: PieceIndex) -> Result<(), SessionError> {
        let _guard = self.priority_lock.lock().await;
        let bitfield = self.session.piece_bitfield(&self.id).await?;
        let gap = Duration::from_millis(self.config.read.deadline_gap_ms);

        for p in p0.as_u32()..=p1.as_u32() {
            let piece = PieceIndex::new(p);
            self.session
                .set_piece_priority(&self.id, piece, PRIORITY_TOP)
                .await?;
            if !bitfield.get(p as usize).copied().unwrap_or(false) {
                let k = p - p0.as_u32();
                self.session
                    .set_piece_deadline(&self.id, piece, gap * k)
                    .await?;
            }
        }
        Ok(())
    }

    /// Retires a read and downgrades its range to the strongest remaining
    /// contribution (pin, other read, prefetch, default).
    async fn finish_read(&self, read_id: u64, p0: PieceIndex, p1: PieceIndex) {
        let _guard = self.priority_lock.lock().await;
        self.reads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(read_id);

        for p in p0.as_u32()..=p1.as_u32() {
            let piece = PieceIndex::new(p);
            let priority = self.effective_priority(piece).await;
            if let Err(e) = self.session.set_piece_priority(&self.id, piece, priority).await {
                tracing::debug!(id = %self.id, piece = p, error = %e, "priority downgrade failed");
            }
        }
    }

    /// Elementwise-max combination of the live priority contributions.
    /// Caller holds `priority_lock`.
    async fn effective_priority(&self, piece: PieceIndex) -> u8 {
        let read_covered = self
            .reads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .covered(piece, None);
        if read_covered || self.pin_covers(piece).await {
            return PRIORITY_TOP;
        }
        if self.prefetch.lock().await.covers(piece.as_u32()) {
            return PRIORITY_PREFETCH;
        }
        PRIORITY_DEFAULT
    }

    async fn pin_covers(&self, piece: PieceIndex) -> bool {
        let pins = self.pins.lock().await;
        pins.iter().any(|path| {
            self.index
                .file(path)
                .map(|entry| (entry.first_piece..=entry.last_piece).contains(&piece))
                .unwrap_or(false)
        })
    }

    // -------------------------------------------------------------------
    // Pins
    // -------------------------------------------------------------------

    /// Pins a file: raises all of its pieces to top priority and persists
    /// the intent.
    pub async fn pin(&self, path: &str) -> Result<(), EngineError> {
        let entry = self.index.file(path)?.clone();

        {
            let _guard = self.priority_lock.lock().await;
            for p in entry.first_piece.as_u32()..=entry.last_piece.as_u32() {
                self.session
                    .set_piece_priority(&self.id, PieceIndex::new(p), PRIORITY_TOP)
                    .await?;
            }
        }

        let mut pins = self.pins.lock().await;
        pins.insert(&entry.path);
        pins.persist().await?;
        Ok(())
    }

    /// Unpins a file and restores its pieces to the strongest remaining
    /// contribution.
    pub async fn unpin(&self, path: &str) -> Result<(), EngineError> {
        let entry = self.index.file(path)?.clone();

        {
            let mut pins = self.pins.lock().await;
            pins.remove(&entry.path);
            pins.persist().await?;
        }

        let _guard = self.priority_lock.lock().await;
        for p in entry.first_piece.as_u32()..=entry.last_piece.as_u32() {
            let piece = PieceIndex::new(p);
            let priority = self.effective_priority(piece).await;
            self.session
                .set_piece_priority(&self.id, piece, priority)
                .await?;
        }
        Ok(())
    }

    /// Enumerates stored pins.
    pub async fn pinned(&self) -> Vec<PinRow> {
        let pins = self.pins.lock().await;
        pins.iter()
            .filter_map(|path| {
                let entry = self.index.file(path).ok()?;
                Some(PinRow {
                    path: entry.path.clone(),
                    file_name: entry.file_name().to_string(),
                    torrent_name: self.metadata.name.clone(),
                    size: entry.size,
                })
            })
            .collect()
    }

    async fn apply_pin_priorities(&self) -> Result<(), EngineError> {
        let pinned_paths: Vec<String> = {
            let pins = self.pins.lock().await;
            pins.iter().cloned().collect()
        };
        let _guard = self.priority_lock.lock().await;
        for path in pinned_paths {
            let Ok(entry) = self.index.file(&path) else {
                continue;
            };
            for p in entry.first_piece.as_u32()..=entry.last_piece.as_u32() {
                self.session
                    .set_piece_priority(&self.id, PieceIndex::new(p), PRIORITY_TOP)
                    .await?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Prefetch
    // -------------------------------------------------------------------

    /// Prefetches a file, or every file under a directory bounded by the
    /// configured limits. Returns how many files were prefetched.
    pub async fn prefetch_path(&self, path: &str) -> Result<usize, EngineError> {
        match self.index.lookup(path)? {
            Located::File(_) => Ok(usize::from(self.prefetch_file(path).await?)),
            Located::Dir { .. } => self.prefetch_dir(path).await,
        }
    }

    async fn prefetch_dir(&self, path: &str) -> Result<usize, EngineError> {
        let cfg = &self.config.prefetch;
        let mut files = Vec::new();
        let mut queue = VecDeque::from([path.to_string()]);
        let mut dirs_visited = 0usize;

        'scan: while let Some(dir) = queue.pop_front() {
            if cfg.max_dirs > 0 && dirs_visited >= cfg.max_dirs {
                tracing::debug!(id = %self.id, limit = cfg.max_dirs, "prefetch stopped at directory limit");
                break;
            }
            dirs_visited += 1;

            for child in self.index.list(&dir)? {
                let child_path = join_path(&dir, &child.name);
                if child.is_dir {
                    queue.push_back(child_path);
                } else {
                    files.push(child_path);
                    if cfg.max_files > 0 && files.len() >= cfg.max_files {
                        tracing::debug!(id = %self.id, limit = cfg.max_files, "prefetch stopped at file limit");
                        break 'scan;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(cfg.scan_sleep_ms)).await;
        }

        let mut applied = 0;
        for file in files {
            if self.prefetch_file(&file).await? {
                applied += 1;
            }
            tokio::time::sleep(Duration::from_millis(cfg.sleep_ms)).await;
        }
        Ok(applied)
    }

    /// Elevates a file's head and tail ranges to prefetch priority.
    /// Returns false when the profile skips the file or the byte budget is
    /// exhausted.
    async fn prefetch_file(&self, path: &str) -> Result<bool, EngineError> {
        let cfg = &self.config.prefetch;
        let entry = self.index.file(path)?.clone();

        let profile = match prefetch::select_profile(cfg, entry.extension().as_deref()) {
            ProfileChoice::Media => &cfg.media.profile,
            ProfileChoice::Other => &cfg.other,
            ProfileChoice::Skip => return Ok(false),
        };

        let ranges = prefetch::compute_ranges(entry.size, profile);
        let byte_ranges = prefetch::byte_ranges(entry.size, ranges);
        if byte_ranges.is_empty() {
            return Ok(false);
        }

        let plan: Vec<u32> = {
            let mut state = self.prefetch.lock().await;
            let budget = cfg.max_mb * 1024 * 1024;
            if budget > 0 && state.bytes >= budget {
                tracing::debug!(id = %self.id, "prefetch byte budget exhausted");
                return Ok(false);
            }

            let mut plan = Vec::new();
            let mut new_bytes = 0u64;
            for &(offset, length) in &byte_ranges {
                let (p0, p1, _) = self.index.pieces_for(&entry, offset, length);
                for p in p0.as_u32()..=p1.as_u32() {
                    if state.pieces.insert(p) {
                        plan.push(p);
                    }
                }
                new_bytes += length;
            }
            state.bytes += new_bytes;
            plan
        };

        // Batched priority raises keep the session responsive during bulk
        // updates.
        for chunk in plan.chunks(cfg.batch_size.max(1)) {
            {
                let _guard = self.priority_lock.lock().await;
                let reads_snapshot: Vec<bool> = {
                    let reads = self.reads.lock().unwrap_or_else(|e| e.into_inner());
                    chunk
                        .iter()
                        .map(|&p| reads.covered(PieceIndex::new(p), None))
                        .collect()
                };
                for (&p, &read_covered) in chunk.iter().zip(&reads_snapshot) {
                    let piece = PieceIndex::new(p);
                    // Max combinator: never lower a piece already at top.
                    if read_covered || self.pin_covers(piece).await {
                        continue;
                    }
                    self.session
                        .set_piece_priority(&self.id, piece, PRIORITY_PREFETCH)
                        .await?;
                }
            }
            tokio::time::sleep(Duration::from_millis(cfg.batch_sleep_ms)).await;
        }

        Ok(true)
    }

    /// Computed prefetch ranges and their availability for one file.
    pub async fn prefetch_info(&self, path: &str) -> Result<PrefetchInfoReport, EngineError> {
        let cfg = &self.config.prefetch;
        let entry = self.index.file(path)?.clone();

        let profile = match prefetch::select_profile(cfg, entry.extension().as_deref()) {
            ProfileChoice::Media => &cfg.media.profile,
            ProfileChoice::Other => &cfg.other,
            ProfileChoice::Skip => {
                return Ok(PrefetchInfoReport {
                    path: entry.path.clone(),
                    size: entry.size,
                    head_bytes: 0,
                    tail_bytes: 0,
                    head_pieces: 0,
                    tail_pieces: 0,
                    have_head: true,
                    have_tail: true,
                });
            }
        };

        let ranges = prefetch::compute_ranges(entry.size, profile);
        let bitfield = self.session.piece_bitfield(&self.id).await?;

        let span = |offset: u64, length: u64| -> (u32, bool) {
            if length == 0 {
                return (0, true);
            }
            let (p0, p1, _) = self.index.pieces_for(&entry, offset, length);
            let count = p1.as_u32() - p0.as_u32() + 1;
            let have = (p0.as_u32()..=p1.as_u32())
                .all(|p| bitfield.get(p as usize).copied().unwrap_or(false));
            (count, have)
        };

        let (head_pieces, have_head) = span(0, ranges.head_bytes.min(entry.size));
        let tail_len = ranges.tail_bytes.min(entry.size);
        let (tail_pieces, have_tail) = span(entry.size - tail_len, tail_len);

        Ok(PrefetchInfoReport {
            path: entry.path.clone(),
            size: entry.size,
            head_bytes: ranges.head_bytes,
            tail_bytes: ranges.tail_bytes,
            head_pieces,
            tail_pieces,
            have_head,
            have_tail,
        })
    }

    // -------------------------------------------------------------------
    // Status / session passthrough
    // -------------------------------------------------------------------

    pub async fn status(&self) -> Result<StatusReport, EngineError> {
        let status = self.session.status(&self.id).await?;
        let fatal = self.fatal();
        let state = if fatal.is_some() {
            TorrentState::Error.to_string()
        } else {
            status.state.to_string()
        };
        Ok(StatusReport {
            name: self.metadata.name.clone(),
            state,
            progress: status.progress(),
            peers: status.peers,
            seeds: status.seeds,
            downloaded: status.total_download,
            uploaded: status.total_upload,
            download_rate: status.download_rate,
            upload_rate: status.upload_rate,
            pieces_total: status.num_pieces,
            pieces_done: status.pieces_have,
            pieces_missing: status.num_pieces - status.pieces_have,
            checking: status.state == TorrentState::CheckingFiles,
            checking_progress: status.checking_progress,
            error: fatal.or(status.error),
        })
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, EngineError> {
        Ok(self.session.peers(&self.id).await?)
    }

    pub async fn reannounce(&self) -> Result<(), EngineError> {
        Ok(self.session.reannounce(&self.id).await?)
    }

    /// Per-file progress rows, incomplete files first, bounded by
    /// `max_files` (0 = unlimited).
    pub async fn file_progress(&self, max_files: usize) -> Result<Vec<FileProgress>, EngineError> {
        let bitfield = self.session.piece_bitfield(&self.id).await?;
        let piece_length = u64::from(self.metadata.piece_length);

        let mut rows = Vec::new();
        for entry in self.index.files() {
            if entry.size == 0 {
                continue;
            }
            let mut have_bytes = 0u64;
            let start = entry.offset;
            let end = entry.offset + entry.size;
            for p in entry.first_piece.as_u32()..=entry.last_piece.as_u32() {
                if !bitfield.get(p as usize).copied().unwrap_or(false) {
                    continue;
                }
                let piece_start = u64::from(p) * piece_length;
                let piece_end = piece_start + piece_length;
                have_bytes += piece_end.min(end) - piece_start.max(start);
            }
            if have_bytes >= entry.size {
                continue;
            }
            rows.push(FileProgress {
                path: entry.path.clone(),
                size: entry.size,
                remaining: entry.size - have_bytes,
                progress_pct: have_bytes as f64 / entry.size as f64 * 100.0,
            });
            if max_files > 0 && rows.len() >= max_files {
                break;
            }
        }
        Ok(rows)
    }

    /// Snapshots resume data to disk atomically.
    pub async fn save_resume(&self) -> Result<(), EngineError> {
        let blob = self.session.save_resume_data(&self.id).await?;
        let resume_path = self.cache_dir.join(RESUME_FILE);
        let tmp_path = resume_path.with_extension("dat.tmp");
        tokio::fs::write(&tmp_path, &blob).await?;
        tokio::fs::rename(&tmp_path, &resume_path).await?;
        Ok(())
    }

    /// Tears the torrent down: cancels outstanding reads with a fatal
    /// error, saves resume data, and removes the session handle.
    pub async fn shutdown(&self, reason: &str) {
        self.note_fault(reason.to_string());
        if let Err(e) = self.save_resume().await {
            tracing::warn!(id = %self.id, error = %e, "failed to save resume data at shutdown");
        }
        if let Err(e) = self.session.remove_torrent(&self.id).await {
            tracing::debug!(id = %self.id, error = %e, "session handle already gone");
        }
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrefetchMode;
    use crate::session::sim::SimSession;
    use crate::torrent::TorrentBuilder;

    async fn engine_with(
        session: SimSession,
        config: DaemonConfig,
        built: &crate::torrent::creation::BuiltTorrent,
        cache_dir: &Path,
    ) -> Arc<Engine> {
        let id = TorrentId::from(built.metadata.info_hash);
        session.seed_content(id.clone(), built.content.clone()).await;
        Engine::create(
            id,
            built.metadata.name.clone(),
            None,
            built.metadata.clone(),
            cache_dir.to_path_buf(),
            Arc::new(session),
            Arc::new(config),
            true,
        )
        .await
        .unwrap()
    }

    fn media_torrent() -> crate::torrent::creation::BuiltTorrent {
        // Two files: 64-byte media file then 32-byte text, 16-byte pieces.
        TorrentBuilder::new("show", 16)
            .file("video.mp4", (0u8..64).collect())
            .file("notes.txt", (0u8..32).collect())
            .build()
    }

    #[tokio::test]
    async fn read_returns_exact_bytes_once_pieces_arrive() {
        let session = SimSession::auto_completing(Duration::from_millis(2));
        let dir = tempfile::tempdir().unwrap();
        let built = media_torrent();
        let engine = engine_with(session, DaemonConfig::default(), &built, dir.path()).await;

        let cancel = CancelToken::new();
        let data = engine
            .read("video.mp4", 10, 20, ReadMode::Auto, Some(Duration::from_secs(5)), &cancel)
            .await
            .unwrap();
        assert_eq!(data, built.content[10..30].to_vec());
    }

    #[tokio::test]
    async fn read_clamps_at_eof_and_returns_empty_past_it() {
        let session = SimSession::new();
        let dir = tempfile::tempdir().unwrap();
        let built = media_torrent();
        let id = TorrentId::from(built.metadata.info_hash);
        let engine = engine_with(session.clone(), DaemonConfig::default(), &built, dir.path()).await;
        session.complete_all(&id).await;

        let cancel = CancelToken::new();
        // notes.txt occupies [64, 96): 32 bytes.
        let data = engine
            .read("notes.txt", 0, 1000, ReadMode::Auto, None, &cancel)
            .await
            .unwrap();
        assert_eq!(data.len(), 32);
        assert_eq!(data, built.content[64..96].to_vec());

        let empty = engine
            .read("notes.txt", 32, 1, ReadMode::Auto, None, &cancel)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn read_size_validation() {
        let session = SimSession::new();
        let dir = tempfile::tempdir().unwrap();
        let built = media_torrent();
        let engine = engine_with(session, DaemonConfig::default(), &built, dir.path()).await;

        let cancel = CancelToken::new();
        assert!(matches!(
            engine.read("notes.txt", 0, 0, ReadMode::Auto, None, &cancel).await,
            Err(ReadError::SizeInvalid)
        ));
        assert!(matches!(
            engine
                .read("notes.txt", 0, MAX_READ_BYTES + 1, ReadMode::Auto, None, &cancel)
                .await,
            Err(ReadError::SizeInvalid)
        ));
    }

    #[tokio::test]
    async fn nowait_returns_prefix_or_would_block() {
        let session = SimSession::new();
        let dir = tempfile::tempdir().unwrap();
        let built = media_torrent();
        let id = TorrentId::from(built.metadata.info_hash);
        let engine = engine_with(session.clone(), DaemonConfig::default(), &built, dir.path()).await;

        let cancel = CancelToken::new();
        assert!(matches!(
            engine
                .read("video.mp4", 0, 64, ReadMode::NoWait, None, &cancel)
                .await,
            Err(ReadError::WouldBlock)
        ));

        // Only the first of four pieces: nowait serves the 16-byte prefix.
        session.complete_piece(&id, PieceIndex::new(0)).await;
        let data = engine
            .read("video.mp4", 0, 64, ReadMode::NoWait, None, &cancel)
            .await
            .unwrap();
        assert_eq!(data, built.content[0..16].to_vec());
    }

    #[tokio::test]
    async fn read_times_out_when_pieces_never_arrive() {
        let session = SimSession::new();
        let dir = tempfile::tempdir().unwrap();
        let built = media_torrent();
        let engine = engine_with(session, DaemonConfig::default(), &built, dir.path()).await;

        let cancel = CancelToken::new();
        let result = engine
            .read(
                "video.mp4",
                0,
                16,
                ReadMode::Auto,
                Some(Duration::from_millis(30)),
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(ReadError::Timeout)));
    }

    #[tokio::test]
    async fn cancelled_read_downgrades_priorities() {
        let session = SimSession::new();
        let dir = tempfile::tempdir().unwrap();
        let built = media_torrent();
        let id = TorrentId::from(built.metadata.info_hash);
        let engine = engine_with(session.clone(), DaemonConfig::default(), &built, dir.path()).await;

        let cancel = Arc::new(CancelToken::new());
        let read = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                engine
                    .read("video.mp4", 0, 16, ReadMode::Sync, None, &cancel)
                    .await
            })
        };

        // Let the read raise priorities, then cancel it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            session.piece_priority(&id, PieceIndex::new(0)).await,
            Some(PRIORITY_TOP)
        );
        cancel.cancel();
        let result = read.await.unwrap();
        assert!(matches!(result, Err(ReadError::Cancelled)));

        assert_eq!(
            session.piece_priority(&id, PieceIndex::new(0)).await,
            Some(PRIORITY_DEFAULT)
        );
    }

    #[tokio::test]
    async fn unpin_restores_default_unless_covered() {
        let session = SimSession::new();
        let dir = tempfile::tempdir().unwrap();
        let built = media_torrent();
        let id = TorrentId::from(built.metadata.info_hash);
        let mut config = DaemonConfig::default();
        config.prefetch.mode = PrefetchMode::All;
        config.prefetch.batch_sleep_ms = 0;
        let engine = engine_with(session.clone(), config, &built, dir.path()).await;

        engine.pin("video.mp4").await.unwrap();
        assert_eq!(
            session.piece_priority(&id, PieceIndex::new(0)).await,
            Some(PRIORITY_TOP)
        );

        // Prefetch covers notes.txt [pieces 4..=5] at priority 6; pin it too,
        // then unpin: the prefetch contribution must survive.
        engine.prefetch_path("notes.txt").await.unwrap();
        engine.pin("notes.txt").await.unwrap();
        assert_eq!(
            session.piece_priority(&id, PieceIndex::new(4)).await,
            Some(PRIORITY_TOP)
        );
        engine.unpin("notes.txt").await.unwrap();
        assert_eq!(
            session.piece_priority(&id, PieceIndex::new(4)).await,
            Some(PRIORITY_PREFETCH)
        );

        engine.unpin("video.mp4").await.unwrap();
        assert_eq!(
            session.piece_priority(&id, PieceIndex::new(0)).await,
            Some(PRIORITY_DEFAULT)
        );
    }

    #[tokio::test]
    async fn pin_is_idempotent_on_disk() {
        let session = SimSession::new();
        let dir = tempfile::tempdir().unwrap();
        let built = media_torrent();
        let engine = engine_with(session, DaemonConfig::default(), &built, dir.path()).await;

        engine.pin("video.mp4").await.unwrap();
        let first = tokio::fs::read(dir.path().join(pins::PIN_FILE)).await.unwrap();
        engine.pin("video.mp4").await.unwrap();
        let second = tokio::fs::read(dir.path().join(pins::PIN_FILE)).await.unwrap();
        assert_eq!(first, second);

        let rows = engine.pinned().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "video.mp4");
        assert_eq!(rows[0].size, 64);
        assert_eq!(rows[0].torrent_name, "show");
    }

    #[tokio::test]
    async fn stale_pins_dropped_at_load() {
        let session = SimSession::new();
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join(pins::PIN_FILE),
            br#"["video.mp4", "no/such/file"]"#,
        )
        .await
        .unwrap();

        let built = media_torrent();
        let engine = engine_with(session, DaemonConfig::default(), &built, dir.path()).await;

        let rows = engine.pinned().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "video.mp4");
    }

    #[tokio::test]
    async fn prefetch_info_reports_clamped_ranges() {
        let mib = 1024 * 1024;
        let built = TorrentBuilder::new("film", mib as u32 / 4)
            .file("film.mkv", vec![0u8; 10 * mib])
            .build();
        let session = SimSession::new();
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(session, DaemonConfig::default(), &built, dir.path()).await;

        let info = engine.prefetch_info("film.mkv").await.unwrap();
        assert_eq!(info.head_bytes, mib as u64);
        assert_eq!(info.tail_bytes, mib as u64);
        assert_eq!(info.head_pieces, 4);
        assert_eq!(info.tail_pieces, 4);
        assert!(!info.have_head);
        assert!(!info.have_tail);
    }

    #[tokio::test]
    async fn media_mode_skips_non_media_files() {
        let session = SimSession::new();
        let dir = tempfile::tempdir().unwrap();
        let built = media_torrent();
        let id = TorrentId::from(built.metadata.info_hash);
        let mut config = DaemonConfig::default();
        config.prefetch.batch_sleep_ms = 0;
        config.prefetch.scan_sleep_ms = 0;
        config.prefetch.sleep_ms = 0;
        let engine = engine_with(session.clone(), config, &built, dir.path()).await;

        let applied = engine.prefetch_path("").await.unwrap();
        assert_eq!(applied, 1);

        // video.mp4 head pieces got elevated, notes.txt stayed default.
        assert_eq!(
            session.piece_priority(&id, PieceIndex::new(0)).await,
            Some(PRIORITY_PREFETCH)
        );
        assert_eq!(
            session.piece_priority(&id, PieceIndex::new(4)).await,
            Some(PRIORITY_DEFAULT)
        );
    }

    #[tokio::test]
    async fn fault_cancels_waiting_reads() {
        let session = SimSession::new();
        let dir = tempfile::tempdir().unwrap();
        let built = media_torrent();
        let engine = engine_with(session, DaemonConfig::default(), &built, dir.path()).await;

        let read = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let cancel = CancelToken::new();
                engine
                    .read("video.mp4", 0, 16, ReadMode::Sync, None, &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.note_fault("tracker exploded".to_string());

        let result = read.await.unwrap();
        assert!(matches!(result, Err(ReadError::Torrent { .. })));
    }
}
