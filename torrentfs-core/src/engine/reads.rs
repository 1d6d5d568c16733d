//! Read scheduling primitives: wakeup signals, cancellation, and the
//! outstanding-reads table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::index::PathError;
use crate::session::SessionError;
use crate::torrent::PieceIndex;

/// Largest read size accepted over RPC.
pub const MAX_READ_BYTES: u64 = 16 * 1024 * 1024;

/// How a read waits for missing pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Wait for the full range, bounded by the request timeout.
    Auto,
    /// Wait for the full range; a null timeout waits indefinitely.
    Sync,
    /// Never wait: return the available prefix or `WouldBlock`.
    NoWait,
}

impl ReadMode {
    /// Parses the wire `mode` field. Unknown values are rejected.
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            "auto" => Some(ReadMode::Auto),
            "sync" => Some(ReadMode::Sync),
            "async" | "nowait" => Some(ReadMode::NoWait),
            _ => None,
        }
    }

    /// Whether this mode blocks on missing pieces.
    pub fn waits(self) -> bool {
        !matches!(self, ReadMode::NoWait)
    }
}

/// Read failures, each mapping to one wire error token.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("read size invalid")]
    SizeInvalid,

    #[error("no data available")]
    WouldBlock,

    #[error("timed out waiting for pieces")]
    Timeout,

    #[error("read cancelled")]
    Cancelled,

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("torrent error: {message}")]
    Torrent { message: String },

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Per-torrent piece-arrival signal.
///
/// A generation counter paired with a `Notify` so a waiter that re-checks
/// between wake and sleep never loses a signal: readers snapshot the
/// generation, re-check state, then wait for the generation to move past
/// their snapshot.
#[derive(Debug, Default)]
pub struct PieceSignal {
    generation: AtomicU64,
    notify: Notify,
}

impl PieceSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation. Snapshot this before inspecting piece state.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Advances the generation and wakes all waiters.
    pub fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Waits until the generation moves past `seen`.
    pub async fn wait_past(&self, seen: u64) {
        loop {
            let notified = self.notify.notified();
            if self.generation.load(Ordering::Acquire) != seen {
                return;
            }
            notified.await;
        }
    }
}

/// Cancellation flag shared between a connection handler and its in-flight
/// read. Wake paths check the flag on every iteration.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// One read currently waiting for pieces.
#[derive(Debug, Clone, Copy)]
pub struct OutstandingRead {
    pub first_piece: PieceIndex,
    pub last_piece: PieceIndex,
}

impl OutstandingRead {
    pub fn covers(&self, piece: PieceIndex) -> bool {
        (self.first_piece..=self.last_piece).contains(&piece)
    }
}

/// Table of in-flight reads keyed by a monotonic id.
#[derive(Debug, Default)]
pub struct OutstandingReads {
    next_id: u64,
    reads: HashMap<u64, OutstandingRead>,
}

impl OutstandingReads {
    pub fn insert(&mut self, read: OutstandingRead) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.reads.insert(id, read);
        id
    }

    pub fn remove(&mut self, id: u64) -> Option<OutstandingRead> {
        self.reads.remove(&id)
    }

    /// Whether any read other than `except` covers `piece`.
    pub fn covered(&self, piece: PieceIndex, except: Option<u64>) -> bool {
        self.reads
            .iter()
            .any(|(&id, read)| Some(id) != except && read.covers(piece))
    }

    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }
}
