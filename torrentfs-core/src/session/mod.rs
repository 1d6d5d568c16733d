//! Session backend seam.
//!
//! The daemon drives piece acquisition through this trait instead of a
//! concrete BitTorrent library. It mirrors the primitives a modern
//! libtorrent exposes: add/remove handles, piece priorities and deadlines,
//! an alert stream, storage reads, and resume data. [`sim::SimSession`]
//! implements it in-process for tests and development; a production
//! deployment binds a real session library to the same trait.

pub mod sim;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::torrent::{PieceIndex, TorrentId, TorrentMetadata};

/// Default priority for pieces nobody asked for.
pub const PRIORITY_DEFAULT: u8 = 1;
/// Priority applied to prefetch head/tail ranges.
pub const PRIORITY_PREFETCH: u8 = 6;
/// Top priority: pins and outstanding reads.
pub const PRIORITY_TOP: u8 = 7;

/// Torrent lifecycle state as reported by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    CheckingFiles,
    Downloading,
    Seeding,
    Paused,
    Error,
}

impl fmt::Display for TorrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TorrentState::CheckingFiles => "checking_files",
            TorrentState::Downloading => "downloading",
            TorrentState::Seeding => "seeding",
            TorrentState::Paused => "paused",
            TorrentState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Notifications drained from the session by the alerts pump.
#[derive(Debug, Clone)]
pub enum SessionAlert {
    PieceFinished {
        id: TorrentId,
        piece: PieceIndex,
    },
    FileCompleted {
        id: TorrentId,
        file_index: u32,
    },
    MetadataReceived {
        id: TorrentId,
    },
    TorrentFault {
        id: TorrentId,
        message: String,
    },
}

impl SessionAlert {
    /// The torrent this alert concerns.
    pub fn torrent_id(&self) -> &TorrentId {
        match self {
            SessionAlert::PieceFinished { id, .. }
            | SessionAlert::FileCompleted { id, .. }
            | SessionAlert::MetadataReceived { id }
            | SessionAlert::TorrentFault { id, .. } => id,
        }
    }
}

/// Session-level failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("torrent {id} not registered with session")]
    UnknownTorrent { id: TorrentId },

    #[error("piece {piece} not available")]
    PieceUnavailable { piece: PieceIndex },

    #[error("{message}")]
    Fault { message: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Parameters for registering a torrent with the session.
#[derive(Debug, Clone)]
pub struct AddTorrentParams {
    pub id: TorrentId,
    pub metadata: TorrentMetadata,
    /// Directory the session materializes payload data into.
    pub save_dir: PathBuf,
    /// Tracker list after alias expansion.
    pub trackers: Vec<String>,
    /// Resume blob from a previous run, if any.
    pub resume_data: Option<Vec<u8>>,
    /// Skip verification of existing cache data.
    pub skip_check: bool,
}

/// Point-in-time torrent status.
#[derive(Debug, Clone)]
pub struct TorrentStatus {
    pub state: TorrentState,
    pub checking_progress: f64,
    pub pieces_have: u32,
    pub num_pieces: u32,
    pub peers: u32,
    pub seeds: u32,
    pub total_download: u64,
    pub total_upload: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub error: Option<String>,
}

impl TorrentStatus {
    /// Fraction of pieces present, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.num_pieces == 0 {
            0.0
        } else {
            f64::from(self.pieces_have) / f64::from(self.num_pieces)
        }
    }
}

/// One connected peer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerInfo {
    pub address: String,
    pub client: String,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub progress: f64,
}

/// BitTorrent session primitives the engine depends on.
#[async_trait]
pub trait SessionBackend: Send + Sync + 'static {
    /// Registers a torrent handle with the session.
    async fn add_torrent(&self, params: AddTorrentParams) -> Result<(), SessionError>;

    /// Removes a torrent handle. Payload data is left on disk; cache
    /// removal is the manager's concern.
    async fn remove_torrent(&self, id: &TorrentId) -> Result<(), SessionError>;

    /// Subscribes to the session's alert stream.
    fn subscribe_alerts(&self) -> broadcast::Receiver<SessionAlert>;

    /// Returns the piece availability bitfield.
    async fn piece_bitfield(&self, id: &TorrentId) -> Result<Vec<bool>, SessionError>;

    /// Whether a single piece is present.
    async fn have_piece(&self, id: &TorrentId, piece: PieceIndex) -> Result<bool, SessionError>;

    /// Sets a piece's download priority (1 = default, 7 = top).
    async fn set_piece_priority(
        &self,
        id: &TorrentId,
        piece: PieceIndex,
        priority: u8,
    ) -> Result<(), SessionError>;

    /// Requests a piece by deadline, measured from now.
    async fn set_piece_deadline(
        &self,
        id: &TorrentId,
        piece: PieceIndex,
        deadline: Duration,
    ) -> Result<(), SessionError>;

    /// Reads bytes from the torrent's concatenated storage. Every piece
    /// overlapping the range must already be present.
    async fn read(&self, id: &TorrentId, offset: u64, len: usize) -> Result<Vec<u8>, SessionError>;

    /// Current status snapshot.
    async fn status(&self, id: &TorrentId) -> Result<TorrentStatus, SessionError>;

    /// Connected peers.
    async fn peers(&self, id: &TorrentId) -> Result<Vec<PeerInfo>, SessionError>;

    /// Forces a tracker/DHT re-announce.
    async fn reannounce(&self, id: &TorrentId) -> Result<(), SessionError>;

    /// Serializes resume data for the torrent.
    async fn save_resume_data(&self, id: &TorrentId) -> Result<Vec<u8>, SessionError>;

    /// Fetches `.torrent` metadata for a magnet link.
    async fn fetch_magnet(&self, magnet_uri: &str) -> Result<Vec<u8>, SessionError>;
}
