//! In-process session backend serving deterministic content from memory.
//!
//! Content is seeded per infohash before `add_torrent`; piece completion is
//! either scripted by tests (`complete_piece`) or triggered automatically
//! when the engine requests a piece by deadline, after a configurable
//! latency. Resume data is a JSON bitfield blob.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};

use super::{
    AddTorrentParams, PeerInfo, SessionAlert, SessionBackend, SessionError, TorrentState,
    TorrentStatus,
};
use crate::torrent::{PieceIndex, TorrentId, TorrentMetadata};

const ALERT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
struct ResumeBlob {
    have: Vec<bool>,
}

struct SimTorrent {
    metadata: TorrentMetadata,
    content: Vec<u8>,
    have: Vec<bool>,
    priorities: Vec<u8>,
    deadlines: HashMap<u32, Duration>,
    state: TorrentState,
    peers: Vec<PeerInfo>,
    total_download: u64,
    reannounces: u64,
    /// (offset, length) per file, in torrent order, for FileCompleted alerts.
    file_ranges: Vec<(u64, u64)>,
}

impl SimTorrent {
    fn piece_span(&self, offset: u64, len: u64) -> (u32, u32) {
        let piece_length = u64::from(self.metadata.piece_length.max(1));
        let p0 = (offset / piece_length) as u32;
        let p1 = if len == 0 {
            p0
        } else {
            ((offset + len - 1) / piece_length) as u32
        };
        (p0, p1)
    }

    fn all_have(&self) -> bool {
        self.have.iter().all(|&h| h)
    }
}

/// Simulated session backend.
///
/// Cloneable handle; all clones share the same torrent table and alert
/// stream.
#[derive(Clone)]
pub struct SimSession {
    torrents: Arc<Mutex<HashMap<TorrentId, SimTorrent>>>,
    seeded: Arc<Mutex<HashMap<TorrentId, Vec<u8>>>>,
    magnets: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    alerts: broadcast::Sender<SessionAlert>,
    /// Complete pieces automatically once a deadline is requested.
    auto_complete: bool,
    /// Simulated swarm latency before an auto-completed piece lands.
    complete_delay: Duration,
}

impl SimSession {
    /// Creates a session that only completes pieces when scripted.
    pub fn new() -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            torrents: Arc::new(Mutex::new(HashMap::new())),
            seeded: Arc::new(Mutex::new(HashMap::new())),
            magnets: Arc::new(Mutex::new(HashMap::new())),
            alerts,
            auto_complete: false,
            complete_delay: Duration::from_millis(5),
        }
    }

    /// Creates a session that completes deadline-requested pieces after
    /// `delay`, emulating a responsive swarm.
    pub fn auto_completing(delay: Duration) -> Self {
        Self {
            auto_complete: true,
            complete_delay: delay,
            ..Self::new()
        }
    }

    /// Seeds content for an infohash so a later `add_torrent` can serve it.
    pub async fn seed_content(&self, id: TorrentId, content: Vec<u8>) {
        self.seeded.lock().await.insert(id, content);
    }

    /// Registers the `.torrent` bytes returned for a magnet URI.
    pub async fn register_magnet(&self, magnet_uri: &str, torrent_bytes: Vec<u8>) {
        self.magnets
            .lock()
            .await
            .insert(magnet_uri.to_string(), torrent_bytes);
    }

    /// Sets the fake peer list reported for a torrent.
    pub async fn set_peers(&self, id: &TorrentId, peers: Vec<PeerInfo>) {
        if let Some(torrent) = self.torrents.lock().await.get_mut(id) {
            torrent.peers = peers;
        }
    }

    /// Marks a piece complete and fires the matching alerts.
    pub async fn complete_piece(&self, id: &TorrentId, piece: PieceIndex) {
        let mut torrents = self.torrents.lock().await;
        let Some(torrent) = torrents.get_mut(id) else {
            return;
        };
        let idx = piece.as_u32() as usize;
        if idx >= torrent.have.len() || torrent.have[idx] {
            return;
        }
        torrent.have[idx] = true;

        let piece_length = u64::from(torrent.metadata.piece_length);
        let piece_size = if idx + 1 == torrent.have.len() {
            torrent.metadata.total_length - piece_length * idx as u64
        } else {
            piece_length
        };
        torrent.total_download += piece_size;

        let _ = self.alerts.send(SessionAlert::PieceFinished {
            id: id.clone(),
            piece,
        });

        // A piece landing can finish one or more files.
        let ranges = torrent.file_ranges.clone();
        for (file_index, (offset, length)) in ranges.iter().enumerate() {
            let (p0, p1) = torrent.piece_span(*offset, *length);
            if (p0..=p1).contains(&piece.as_u32())
                && (p0..=p1).all(|p| torrent.have[p as usize])
            {
                let _ = self.alerts.send(SessionAlert::FileCompleted {
                    id: id.clone(),
                    file_index: file_index as u32,
                });
            }
        }

        if torrent.all_have() {
            torrent.state = TorrentState::Seeding;
        }
    }

    /// Completes every piece of a torrent.
    pub async fn complete_all(&self, id: &TorrentId) {
        let num_pieces = {
            let torrents = self.torrents.lock().await;
            match torrents.get(id) {
                Some(t) => t.have.len() as u32,
                None => return,
            }
        };
        for piece in 0..num_pieces {
            self.complete_piece(id, PieceIndex::new(piece)).await;
        }
    }

    /// Injects a fatal torrent error.
    pub async fn fail_torrent(&self, id: &TorrentId, message: &str) {
        if let Some(torrent) = self.torrents.lock().await.get_mut(id) {
            torrent.state = TorrentState::Error;
        }
        let _ = self.alerts.send(SessionAlert::TorrentFault {
            id: id.clone(),
            message: message.to_string(),
        });
    }

    /// Returns how often `reannounce` was called for a torrent.
    pub async fn reannounce_count(&self, id: &TorrentId) -> u64 {
        self.torrents
            .lock()
            .await
            .get(id)
            .map(|t| t.reannounces)
            .unwrap_or(0)
    }

    /// Returns the last priority applied to a piece (test observability).
    pub async fn piece_priority(&self, id: &TorrentId, piece: PieceIndex) -> Option<u8> {
        self.torrents
            .lock()
            .await
            .get(id)
            .and_then(|t| t.priorities.get(piece.as_u32() as usize).copied())
    }

    /// Returns the deadline recorded for a piece, if one was requested.
    pub async fn piece_deadline(&self, id: &TorrentId, piece: PieceIndex) -> Option<Duration> {
        self.torrents
            .lock()
            .await
            .get(id)
            .and_then(|t| t.deadlines.get(&piece.as_u32()).copied())
    }
}

impl Default for SimSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionBackend for SimSession {
    async fn add_torrent(&self, params: AddTorrentParams) -> Result<(), SessionError> {
        let num_pieces = params.metadata.num_pieces() as usize;
        let content = self
            .seeded
            .lock()
            .await
            .get(&params.id)
            .cloned()
            .unwrap_or_else(|| vec![0u8; params.metadata.total_length as usize]);

        let mut have = vec![false; num_pieces];
        if let Some(blob) = &params.resume_data {
            match serde_json::from_slice::<ResumeBlob>(blob) {
                Ok(resume) if resume.have.len() == num_pieces => have = resume.have,
                Ok(_) => tracing::warn!(id = %params.id, "resume data bitfield size mismatch, ignoring"),
                Err(e) => tracing::warn!(id = %params.id, error = %e, "invalid resume data, ignoring"),
            }
        }

        let mut file_ranges = Vec::with_capacity(params.metadata.files.len());
        let mut offset = 0u64;
        for file in &params.metadata.files {
            file_ranges.push((offset, file.length));
            offset += file.length;
        }

        let state = if !params.skip_check && params.resume_data.is_none() {
            // An instantaneous check: real backends linger in this state.
            TorrentState::CheckingFiles
        } else {
            TorrentState::Downloading
        };

        let torrent = SimTorrent {
            priorities: vec![super::PRIORITY_DEFAULT; num_pieces],
            deadlines: HashMap::new(),
            metadata: params.metadata,
            content,
            have,
            state,
            peers: Vec::new(),
            total_download: 0,
            reannounces: 0,
            file_ranges,
        };

        self.torrents.lock().await.insert(params.id.clone(), torrent);

        // Check completes immediately in the sim.
        if let Some(t) = self.torrents.lock().await.get_mut(&params.id)
            && t.state == TorrentState::CheckingFiles
        {
            t.state = if t.all_have() && !t.have.is_empty() {
                TorrentState::Seeding
            } else {
                TorrentState::Downloading
            };
        }

        let _ = self.alerts.send(SessionAlert::MetadataReceived { id: params.id });
        Ok(())
    }

    async fn remove_torrent(&self, id: &TorrentId) -> Result<(), SessionError> {
        self.torrents
            .lock()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SessionError::UnknownTorrent { id: id.clone() })
    }

    fn subscribe_alerts(&self) -> broadcast::Receiver<SessionAlert> {
        self.alerts.subscribe()
    }

    async fn piece_bitfield(&self, id: &TorrentId) -> Result<Vec<bool>, SessionError> {
        let torrents = self.torrents.lock().await;
        let torrent = torrents
            .get(id)
            .ok_or_else(|| SessionError::UnknownTorrent { id: id.clone() })?;
        Ok(torrent.have.clone())
    }

    async fn have_piece(&self, id: &TorrentId, piece: PieceIndex) -> Result<bool, SessionError> {
        let torrents = self.torrents.lock().await;
        let torrent = torrents
            .get(id)
            .ok_or_else(|| SessionError::UnknownTorrent { id: id.clone() })?;
        Ok(torrent
            .have
            .get(piece.as_u32() as usize)
            .copied()
            .unwrap_or(false))
    }

    async fn set_piece_priority(
        &self,
        id: &TorrentId,
        piece: PieceIndex,
        priority: u8,
    ) -> Result<(), SessionError> {
        let mut torrents = self.torrents.lock().await;
        let torrent = torrents
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownTorrent { id: id.clone() })?;
        let idx = piece.as_u32() as usize;
        if idx >= torrent.priorities.len() {
            return Err(SessionError::PieceUnavailable { piece });
        }
        torrent.priorities[idx] = priority;
        Ok(())
    }

    async fn set_piece_deadline(
        &self,
        id: &TorrentId,
        piece: PieceIndex,
        deadline: Duration,
    ) -> Result<(), SessionError> {
        {
            let mut torrents = self.torrents.lock().await;
            let torrent = torrents
                .get_mut(id)
                .ok_or_else(|| SessionError::UnknownTorrent { id: id.clone() })?;
            if piece.as_u32() as usize >= torrent.have.len() {
                return Err(SessionError::PieceUnavailable { piece });
            }
            torrent.deadlines.insert(piece.as_u32(), deadline);
        }

        if self.auto_complete {
            let session = self.clone();
            let id = id.clone();
            let delay = self.complete_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                session.complete_piece(&id, piece).await;
            });
        }
        Ok(())
    }

    async fn read(&self, id: &TorrentId, offset: u64, len: usize) -> Result<Vec<u8>, SessionError> {
        let torrents = self.torrents.lock().await;
        let torrent = torrents
            .get(id)
            .ok_or_else(|| SessionError::UnknownTorrent { id: id.clone() })?;

        let end = (offset + len as u64).min(torrent.content.len() as u64);
        let start = offset.min(end);
        let (p0, p1) = torrent.piece_span(start, end - start);
        for p in p0..=p1 {
            if !torrent.have.get(p as usize).copied().unwrap_or(false) {
                return Err(SessionError::PieceUnavailable {
                    piece: PieceIndex::new(p),
                });
            }
        }
        Ok(torrent.content[start as usize..end as usize].to_vec())
    }

    async fn status(&self, id: &TorrentId) -> Result<TorrentStatus, SessionError> {
        let torrents = self.torrents.lock().await;
        let torrent = torrents
            .get(id)
            .ok_or_else(|| SessionError::UnknownTorrent { id: id.clone() })?;
        Ok(TorrentStatus {
            state: torrent.state,
            checking_progress: 1.0,
            pieces_have: torrent.have.iter().filter(|&&h| h).count() as u32,
            num_pieces: torrent.have.len() as u32,
            peers: torrent.peers.len() as u32,
            seeds: torrent
                .peers
                .iter()
                .filter(|p| p.progress >= 1.0)
                .count() as u32,
            total_download: torrent.total_download,
            total_upload: 0,
            download_rate: 0,
            upload_rate: 0,
            error: None,
        })
    }

    async fn peers(&self, id: &TorrentId) -> Result<Vec<PeerInfo>, SessionError> {
        let torrents = self.torrents.lock().await;
        let torrent = torrents
            .get(id)
            .ok_or_else(|| SessionError::UnknownTorrent { id: id.clone() })?;
        Ok(torrent.peers.clone())
    }

    async fn reannounce(&self, id: &TorrentId) -> Result<(), SessionError> {
        let mut torrents = self.torrents.lock().await;
        let torrent = torrents
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownTorrent { id: id.clone() })?;
        torrent.reannounces += 1;
        Ok(())
    }

    async fn save_resume_data(&self, id: &TorrentId) -> Result<Vec<u8>, SessionError> {
        let torrents = self.torrents.lock().await;
        let torrent = torrents
            .get(id)
            .ok_or_else(|| SessionError::UnknownTorrent { id: id.clone() })?;
        let blob = ResumeBlob {
            have: torrent.have.clone(),
        };
        serde_json::to_vec(&blob).map_err(|e| SessionError::Fault {
            message: format!("resume serialization failed: {e}"),
        })
    }

    async fn fetch_magnet(&self, magnet_uri: &str) -> Result<Vec<u8>, SessionError> {
        self.magnets
            .lock()
            .await
            .get(magnet_uri)
            .cloned()
            .ok_or_else(|| SessionError::Fault {
                message: format!("no metadata source for magnet {magnet_uri}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentBuilder;

    fn params(built: &crate::torrent::creation::BuiltTorrent) -> AddTorrentParams {
        AddTorrentParams {
            id: TorrentId::from(built.metadata.info_hash),
            metadata: built.metadata.clone(),
            save_dir: std::env::temp_dir(),
            trackers: Vec::new(),
            resume_data: None,
            skip_check: true,
        }
    }

    #[tokio::test]
    async fn read_requires_pieces() {
        let session = SimSession::new();
        let built = TorrentBuilder::new("t", 4).file("a", b"abcdefgh".to_vec()).build();
        let id = TorrentId::from(built.metadata.info_hash);
        session.seed_content(id.clone(), built.content.clone()).await;
        session.add_torrent(params(&built)).await.unwrap();

        assert!(matches!(
            session.read(&id, 0, 4).await,
            Err(SessionError::PieceUnavailable { .. })
        ));

        session.complete_piece(&id, PieceIndex::new(0)).await;
        assert_eq!(session.read(&id, 0, 4).await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn piece_completion_emits_alerts_and_flips_state() {
        let session = SimSession::new();
        let built = TorrentBuilder::new("t", 4).file("a", b"abcdefgh".to_vec()).build();
        let id = TorrentId::from(built.metadata.info_hash);
        let mut alerts = session.subscribe_alerts();
        session.seed_content(id.clone(), built.content.clone()).await;
        session.add_torrent(params(&built)).await.unwrap();

        session.complete_all(&id).await;

        let status = session.status(&id).await.unwrap();
        assert_eq!(status.state, TorrentState::Seeding);
        assert_eq!(status.pieces_have, 2);

        let mut saw_piece = false;
        let mut saw_file = false;
        while let Ok(alert) = alerts.try_recv() {
            match alert {
                SessionAlert::PieceFinished { .. } => saw_piece = true,
                SessionAlert::FileCompleted { .. } => saw_file = true,
                _ => {}
            }
        }
        assert!(saw_piece);
        assert!(saw_file);
    }

    #[tokio::test]
    async fn resume_data_round_trips() {
        let session = SimSession::new();
        let built = TorrentBuilder::new("t", 4).file("a", b"abcdefgh".to_vec()).build();
        let id = TorrentId::from(built.metadata.info_hash);
        session.seed_content(id.clone(), built.content.clone()).await;
        session.add_torrent(params(&built)).await.unwrap();
        session.complete_piece(&id, PieceIndex::new(1)).await;

        let blob = session.save_resume_data(&id).await.unwrap();
        session.remove_torrent(&id).await.unwrap();

        let mut p = params(&built);
        p.resume_data = Some(blob);
        session.seed_content(id.clone(), built.content.clone()).await;
        session.add_torrent(p).await.unwrap();

        assert!(!session.have_piece(&id, PieceIndex::new(0)).await.unwrap());
        assert!(session.have_piece(&id, PieceIndex::new(1)).await.unwrap());
    }
}
